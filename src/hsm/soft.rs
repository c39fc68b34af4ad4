//! A process-local soft token.
//!
//! Stands in for a real HSM during development and in tests.  It mints
//! random locators and remembers them per repository; there is no actual
//! key material behind them.

use std::sync::Mutex;

use ring::rand::{SecureRandom, SystemRandom};

use super::{GeneratedKey, Hsm, HsmError, key_type_for_algorithm};
use crate::util::hex_encode;

//----------- SoftHsm ----------------------------------------------------------

/// A soft token holding locators in memory.
pub struct SoftHsm {
    repositories: Vec<String>,
    keys: Mutex<foldhash::HashMap<String, Vec<String>>>,
    rng: SystemRandom,
}

impl SoftHsm {
    /// A soft token serving the given repositories.
    pub fn new(repositories: Vec<String>) -> Self {
        Self {
            keys: Mutex::new(
                repositories
                    .iter()
                    .map(|r| (r.clone(), Vec::new()))
                    .collect(),
            ),
            repositories,
            rng: SystemRandom::new(),
        }
    }
}

impl Hsm for SoftHsm {
    fn repositories(&self) -> Vec<String> {
        self.repositories.clone()
    }

    fn generate_key(
        &self,
        repository: &str,
        algorithm: u32,
        _bits: u32,
    ) -> Result<GeneratedKey, HsmError> {
        let mut keys = self.keys.lock().expect("soft token lock is never poisoned");
        let Some(repo) = keys.get_mut(repository) else {
            return Err(HsmError::UnknownRepository(repository.into()));
        };

        let mut raw = [0u8; 16];
        self.rng
            .fill(&mut raw)
            .map_err(|_| HsmError::Failed("no entropy available".into()))?;
        let locator = hex_encode(&raw);
        repo.push(locator.clone());

        Ok(GeneratedKey {
            locator,
            key_type: key_type_for_algorithm(algorithm).into(),
        })
    }

    fn find_key(&self, repository: &str, locator: &str) -> Result<bool, HsmError> {
        let keys = self.keys.lock().expect("soft token lock is never poisoned");
        let Some(repo) = keys.get(repository) else {
            return Err(HsmError::UnknownRepository(repository.into()));
        };
        Ok(repo.iter().any(|l| l == locator))
    }

    fn delete_key(&self, repository: &str, locator: &str) -> Result<(), HsmError> {
        let mut keys = self.keys.lock().expect("soft token lock is never poisoned");
        let Some(repo) = keys.get_mut(repository) else {
            return Err(HsmError::UnknownRepository(repository.into()));
        };
        match repo.iter().position(|l| l == locator) {
            Some(pos) => {
                repo.remove(pos);
                Ok(())
            }
            None => Err(HsmError::Failed(format!("no key with locator {locator}"))),
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_find_delete() {
        let hsm = SoftHsm::new(vec!["default".into()]);
        let key = hsm.generate_key("default", 13, 256).unwrap();
        assert_eq!(key.key_type, "EC");
        assert_eq!(key.locator.len(), 32);

        assert!(hsm.find_key("default", &key.locator).unwrap());
        hsm.delete_key("default", &key.locator).unwrap();
        assert!(!hsm.find_key("default", &key.locator).unwrap());
    }

    #[test]
    fn unknown_repository() {
        let hsm = SoftHsm::new(vec!["default".into()]);
        assert!(matches!(
            hsm.generate_key("missing", 13, 256),
            Err(HsmError::UnknownRepository(_))
        ));
    }
}
