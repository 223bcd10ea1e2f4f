use crate::error::VayuError;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
}

impl ConfigValue {
    fn type_tag(&self) -> &'static str {
        match self {
            ConfigValue::Int(_) => "int",
            ConfigValue::Double(_) => "double",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::String(_) => "string",
        }
    }

    fn encode(&self) -> String {
        match self {
            ConfigValue::Int(v) => v.to_string(),
            ConfigValue::Double(v) => v.to_string(),
            ConfigValue::Bool(v) => v.to_string(),
            ConfigValue::String(v) => v.clone(),
        }
    }

    fn decode(type_tag: &str, raw: &str) -> Option<Self> {
        match type_tag {
            "int" => raw.parse().ok().map(ConfigValue::Int),
            "double" => raw.parse().ok().map(ConfigValue::Double),
            "bool" => raw.parse().ok().map(ConfigValue::Bool),
            "string" => Some(ConfigValue::String(raw.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigConstraints {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ConfigConstraints {
    fn allows(&self, value: &ConfigValue) -> bool {
        let numeric = match value {
            ConfigValue::Int(v) => Some(*v as f64),
            ConfigValue::Double(v) => Some(*v),
            _ => None,
        };
        match numeric {
            Some(n) => {
                if let Some(min) = self.min {
                    if n < min {
                        return false;
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        return false;
                    }
                }
                true
            }
            None => true,
        }
    }
}

/// Process-wide typed configuration: writes validate then persist then
/// refresh the cache under an exclusive lock; reads take a cheap snapshot.
pub struct Config {
    storage: Storage,
    cache: Arc<RwLock<HashMap<String, (ConfigValue, Option<ConfigConstraints>)>>>,
}

impl Config {
    pub async fn load(storage: Storage) -> Result<Self, VayuError> {
        let config = Self {
            storage,
            cache: Arc::new(RwLock::new(HashMap::new())),
        };
        config.reload().await?;
        Ok(config)
    }

    /// Rebuilds the cache from storage; invoked at boot and on admin reload.
    pub async fn reload(&self) -> Result<(), VayuError> {
        let entries = self.storage.config_list().await?;
        let mut cache = self.cache.write().expect("config cache poisoned");
        cache.clear();
        for (key, value, type_tag) in entries {
            if let Some(decoded) = ConfigValue::decode(&type_tag, &value) {
                cache.insert(key, (decoded, None));
            }
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: ConfigValue, constraints: Option<ConfigConstraints>) -> Result<(), VayuError> {
        if let Some(ref c) = constraints {
            if !c.allows(&value) {
                return Err(VayuError::Validation(format!("value for `{key}` violates constraints")));
            }
        } else if let Some((_, Some(existing))) = self.cache.read().expect("config cache poisoned").get(key) {
            if !existing.allows(&value) {
                return Err(VayuError::Validation(format!("value for `{key}` violates constraints")));
            }
        }

        self.storage.config_set(key.to_string(), value.encode(), value.type_tag().to_string()).await?;

        let mut cache = self.cache.write().expect("config cache poisoned");
        let entry_constraints = constraints.or_else(|| cache.get(key).and_then(|(_, c)| c.clone()));
        cache.insert(key.to_string(), (value, entry_constraints));
        Ok(())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.cache.read().expect("config cache poisoned").get(key) {
            Some((ConfigValue::Int(v), _)) => *v,
            _ => default,
        }
    }

    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        match self.cache.read().expect("config cache poisoned").get(key) {
            Some((ConfigValue::Double(v), _)) => *v,
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.cache.read().expect("config cache poisoned").get(key) {
            Some((ConfigValue::Bool(v), _)) => *v,
            _ => default,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.cache.read().expect("config cache poisoned").get(key) {
            Some((ConfigValue::String(v), _)) => v.clone(),
            _ => default.to_string(),
        }
    }

    pub fn list(&self) -> Vec<(String, ConfigValue)> {
        self.cache
            .read()
            .expect("config cache poisoned")
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }
}
