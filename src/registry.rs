//! The identity registry seam.
//!
//! Identities are named entries that may carry aliases. Each identity holds source associations
//! (this user in that registry *is* the identity) and target associations (the identity *acts as*
//! this user in that registry). Target associations carry free-form additional-info tags, which
//! is how published keys are marked `cur`/`prev` and found by their timestamp.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub name: String,
    pub aliases: Vec<String>,
}

/// A user in some registry, as returned by an association lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryUser {
    pub user_name: String,
    pub additional_info: Vec<String>,
}

/// The directory that maps identities, users, and published keys. Calls are synchronous and
/// treated as strongly consistent; there are no transactions across calls.
pub trait Registry: Send + Sync {
    fn find_identities_by_name(&self, name: &str) -> Result<Vec<IdentityEntry>, RegistryError>;

    fn find_identities_by_alias(&self, alias: &str) -> Result<Vec<IdentityEntry>, RegistryError>;

    /// Target associations of `identity` in `registry`. With a filter, only associations carrying
    /// that exact additional-info tag are returned.
    fn find_target_associations(
        &self,
        identity: &str,
        registry: &str,
        filter: Option<&str>,
    ) -> Result<Vec<RegistryUser>, RegistryError>;

    fn add_target_association(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
        additional_info: &[String],
    ) -> Result<(), RegistryError>;

    fn remove_target_association(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
    ) -> Result<(), RegistryError>;

    fn add_additional_info(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
        info: &str,
    ) -> Result<(), RegistryError>;

    fn remove_additional_info(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
        info: &str,
    ) -> Result<(), RegistryError>;

    /// Map `user` in `source_registry` to its users in `target_registry`, through every identity
    /// the user is a source for.
    fn find_target_from_source(
        &self,
        user: &str,
        source_registry: &str,
        target_registry: &str,
    ) -> Result<Vec<RegistryUser>, RegistryError>;
}

macro_rules! forward_registry {
    ($($ptr:tt)*) => {
        impl<R: Registry + ?Sized> Registry for $($ptr)* {
            fn find_identities_by_name(&self, name: &str) -> Result<Vec<IdentityEntry>, RegistryError> {
                (**self).find_identities_by_name(name)
            }
            fn find_identities_by_alias(&self, alias: &str) -> Result<Vec<IdentityEntry>, RegistryError> {
                (**self).find_identities_by_alias(alias)
            }
            fn find_target_associations(
                &self,
                identity: &str,
                registry: &str,
                filter: Option<&str>,
            ) -> Result<Vec<RegistryUser>, RegistryError> {
                (**self).find_target_associations(identity, registry, filter)
            }
            fn add_target_association(
                &self,
                identity: &str,
                registry: &str,
                user_name: &str,
                additional_info: &[String],
            ) -> Result<(), RegistryError> {
                (**self).add_target_association(identity, registry, user_name, additional_info)
            }
            fn remove_target_association(
                &self,
                identity: &str,
                registry: &str,
                user_name: &str,
            ) -> Result<(), RegistryError> {
                (**self).remove_target_association(identity, registry, user_name)
            }
            fn add_additional_info(
                &self,
                identity: &str,
                registry: &str,
                user_name: &str,
                info: &str,
            ) -> Result<(), RegistryError> {
                (**self).add_additional_info(identity, registry, user_name, info)
            }
            fn remove_additional_info(
                &self,
                identity: &str,
                registry: &str,
                user_name: &str,
                info: &str,
            ) -> Result<(), RegistryError> {
                (**self).remove_additional_info(identity, registry, user_name, info)
            }
            fn find_target_from_source(
                &self,
                user: &str,
                source_registry: &str,
                target_registry: &str,
            ) -> Result<Vec<RegistryUser>, RegistryError> {
                (**self).find_target_from_source(user, source_registry, target_registry)
            }
        }
    };
}

forward_registry!(&R);
forward_registry!(Arc<R>);
forward_registry!(Box<R>);

#[derive(Clone, Debug)]
struct Association {
    registry: String,
    user_name: String,
    additional_info: BTreeSet<String>,
}

impl Association {
    fn to_user(&self) -> RegistryUser {
        RegistryUser {
            user_name: self.user_name.clone(),
            additional_info: self.additional_info.iter().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug)]
struct MemoryIdentity {
    entry: IdentityEntry,
    sources: Vec<Association>,
    targets: Vec<Association>,
}

/// A registry held entirely in memory.
///
/// Identity names aren't forced to be unique: a second [`add_identity`][Self::add_identity] with
/// the same name creates a second entry, and name-addressed writes apply to all of them.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    identities: Mutex<Vec<MemoryIdentity>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MemoryIdentity>> {
        self.identities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_identity(&self, name: &str, aliases: &[&str]) {
        self.lock().push(MemoryIdentity {
            entry: IdentityEntry {
                name: name.to_owned(),
                aliases: aliases.iter().map(|a| (*a).to_owned()).collect(),
            },
            sources: Vec::new(),
            targets: Vec::new(),
        });
    }

    /// Record that `user_name` in `registry` is the identity `identity`.
    pub fn add_source_association(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
    ) -> Result<(), RegistryError> {
        self.with_identity("add source association", identity, |id| {
            id.sources.push(Association {
                registry: registry.to_owned(),
                user_name: user_name.to_owned(),
                additional_info: BTreeSet::new(),
            });
            Ok(())
        })
        .map(|_| ())
    }

    fn with_identity<T>(
        &self,
        operation: &'static str,
        identity: &str,
        mut f: impl FnMut(&mut MemoryIdentity) -> Result<T, RegistryError>,
    ) -> Result<Vec<T>, RegistryError> {
        let mut ids = self.lock();
        let mut out = Vec::new();
        for id in ids.iter_mut().filter(|id| id.entry.name == identity) {
            out.push(f(id)?);
        }
        if out.is_empty() {
            return Err(RegistryError::new(
                operation,
                format!("no identity named {:?}", identity),
            ));
        }
        Ok(out)
    }

    fn with_target<T>(
        &self,
        operation: &'static str,
        identity: &str,
        registry: &str,
        user_name: &str,
        mut f: impl FnMut(&mut Association) -> T,
    ) -> Result<(), RegistryError> {
        self.with_identity(operation, identity, |id| {
            let assoc = id
                .targets
                .iter_mut()
                .find(|a| a.registry == registry && a.user_name == user_name)
                .ok_or_else(|| {
                    RegistryError::new(
                        operation,
                        format!("no target association {:?} in {:?}", user_name, registry),
                    )
                })?;
            f(assoc);
            Ok(())
        })
        .map(|_| ())
    }
}

impl Registry for MemoryRegistry {
    fn find_identities_by_name(&self, name: &str) -> Result<Vec<IdentityEntry>, RegistryError> {
        Ok(self
            .lock()
            .iter()
            .filter(|id| id.entry.name == name)
            .map(|id| id.entry.clone())
            .collect())
    }

    fn find_identities_by_alias(&self, alias: &str) -> Result<Vec<IdentityEntry>, RegistryError> {
        Ok(self
            .lock()
            .iter()
            .filter(|id| id.entry.aliases.iter().any(|a| a == alias))
            .map(|id| id.entry.clone())
            .collect())
    }

    fn find_target_associations(
        &self,
        identity: &str,
        registry: &str,
        filter: Option<&str>,
    ) -> Result<Vec<RegistryUser>, RegistryError> {
        let ids = self.lock();
        Ok(ids
            .iter()
            .filter(|id| id.entry.name == identity)
            .flat_map(|id| id.targets.iter())
            .filter(|a| a.registry == registry)
            .filter(|a| filter.map_or(true, |f| a.additional_info.contains(f)))
            .map(Association::to_user)
            .collect())
    }

    fn add_target_association(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
        additional_info: &[String],
    ) -> Result<(), RegistryError> {
        self.with_identity("add target association", identity, |id| {
            match id
                .targets
                .iter_mut()
                .find(|a| a.registry == registry && a.user_name == user_name)
            {
                Some(existing) => existing
                    .additional_info
                    .extend(additional_info.iter().cloned()),
                None => id.targets.push(Association {
                    registry: registry.to_owned(),
                    user_name: user_name.to_owned(),
                    additional_info: additional_info.iter().cloned().collect(),
                }),
            }
            Ok(())
        })
        .map(|_| ())
    }

    fn remove_target_association(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
    ) -> Result<(), RegistryError> {
        self.with_identity("remove target association", identity, |id| {
            id.targets
                .retain(|a| !(a.registry == registry && a.user_name == user_name));
            Ok(())
        })
        .map(|_| ())
    }

    fn add_additional_info(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
        info: &str,
    ) -> Result<(), RegistryError> {
        self.with_target("add additional info", identity, registry, user_name, |a| {
            a.additional_info.insert(info.to_owned())
        })
    }

    fn remove_additional_info(
        &self,
        identity: &str,
        registry: &str,
        user_name: &str,
        info: &str,
    ) -> Result<(), RegistryError> {
        self.with_target("remove additional info", identity, registry, user_name, |a| {
            a.additional_info.remove(info)
        })
    }

    fn find_target_from_source(
        &self,
        user: &str,
        source_registry: &str,
        target_registry: &str,
    ) -> Result<Vec<RegistryUser>, RegistryError> {
        let ids = self.lock();
        Ok(ids
            .iter()
            .filter(|id| {
                id.sources
                    .iter()
                    .any(|s| s.registry == source_registry && s.user_name == user)
            })
            .flat_map(|id| id.targets.iter())
            .filter(|t| t.registry == target_registry)
            .map(Association::to_user)
            .collect())
    }
}
