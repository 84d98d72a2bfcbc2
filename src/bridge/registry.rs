//! Content-addressed module registry.
//!
//! The kernel never materialises data URLs for dynamic imports; it hands
//! module bytes to the host's `load` capability once and afterwards refers
//! to the module by the hash of those bytes.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use super::BridgeError;

/// SHA-256 of the module bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleKey([u8; 32]);

impl ModuleKey {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ModuleKey(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl core::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Short form reads better in logs and errors.
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Host capability that turns bytes into a loaded module.
pub trait ModuleLoader {
    type Module;

    fn load(&mut self, name: &str, bytes: &[u8]) -> Result<Self::Module, BridgeError>;
}

pub struct ModuleRegistry<M> {
    modules: HashMap<ModuleKey, M>,
}

impl<M> ModuleRegistry<M> {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: HashMap::new(),
        }
    }

    /// Load `bytes` under their content address; a module already present
    /// is not loaded twice.
    pub fn load_bytes<L>(&mut self, loader: &mut L, bytes: &[u8]) -> Result<ModuleKey, BridgeError>
    where
        L: ModuleLoader<Module = M>,
    {
        let key = ModuleKey::of(bytes);
        if !self.modules.contains_key(&key) {
            let module = loader.load(&key.to_hex(), bytes)?;
            self.modules.insert(key, module);
        }
        Ok(key)
    }

    pub fn get(&self, key: ModuleKey) -> Option<&M> {
        self.modules.get(&key)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl<M> Default for ModuleRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}
