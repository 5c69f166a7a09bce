use crate::error::Result;
use crate::store::Store;
use async_trait::async_trait;

pub const AUTO_ADMIT_KEY: &str = "auto_admit";

/// Read-mostly key/value settings.
#[async_trait]
pub trait Settings: Send + Sync {
    async fn get(&self, key: &str, default: &str) -> Result<String>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let raw = self.get(key, if default { "true" } else { "false" }).await?;
        Ok(parse_flag(&raw).unwrap_or(default))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Clone)]
pub struct SqliteSettings {
    store: Store,
}

impl SqliteSettings {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Settings for SqliteSettings {
    async fn get(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .store
            .get_setting(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store.set_setting(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bool_settings_fall_back_to_default() {
        let settings = SqliteSettings::new(Store::open_in_memory().expect("store"));
        assert!(settings.get_bool(AUTO_ADMIT_KEY, true).await.expect("get"));

        settings.set(AUTO_ADMIT_KEY, "false").await.expect("set");
        assert!(!settings.get_bool(AUTO_ADMIT_KEY, true).await.expect("get"));

        settings.set(AUTO_ADMIT_KEY, "maybe").await.expect("set");
        assert!(settings.get_bool(AUTO_ADMIT_KEY, true).await.expect("get"));
        assert_eq!(
            settings.get(AUTO_ADMIT_KEY, "x").await.expect("raw"),
            "maybe"
        );
    }
}
