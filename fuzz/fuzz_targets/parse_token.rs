#![no_main]
use libfuzzer_sys::fuzz_target;
use identity_token::Token;

fuzz_target!(|data: &[u8]| {
    if let Ok(token) = Token::from_bytes(data) {
        // Anything that parses must re-encode to exactly the same bytes
        assert_eq!(token.to_bytes().unwrap(), data);
    }
});
