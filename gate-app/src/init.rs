//! Configuration scaffolding for `gatekeep init`.
//!
//! Writes `~/.gatekeep/config.toml` from the bundled template without overwriting
//! an existing file.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATE_FILES: &[TemplateFile] = &[
    TemplateFile {
        relative_path: "config.toml",
        contents: include_str!("../../config-templates/config.toml"),
    },
    TemplateFile {
        relative_path: ".env.example",
        contents: include_str!("../../.env.example"),
    },
];

pub async fn initialize_default() -> Result<InitReport> {
    let config_path = crate::config::default_config_path()?;
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid default config path: {}", config_path.display()))?
        .to_path_buf();
    initialize_at_root(&root).await
}

pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        created: Vec::new(),
        skipped: Vec::new(),
    };

    for template in TEMPLATE_FILES {
        let target = root.join(template.relative_path);
        match tokio::fs::metadata(&target).await {
            Ok(_) => {
                report.skipped.push(target);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&target, template.contents)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("write config template {}: {e}", target.display())
                    })?;
                tracing::debug!(path = %target.display(), "config template written");
                report.created.push(target);
            }
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "inspect config path {}: {err}",
                    target.display()
                ));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{TEMPLATE_FILES, initialize_at_root};
    use crate::config::GatekeepConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gatekeep-init-{name}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn init_creates_all_templates_when_missing() {
        let root = temp_root("create");
        let report = initialize_at_root(&root).await.expect("init succeeds");

        assert_eq!(report.created.len(), TEMPLATE_FILES.len());
        assert!(report.skipped.is_empty());
        for template in TEMPLATE_FILES {
            let target = root.join(template.relative_path);
            assert!(target.exists(), "missing template {}", target.display());
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn init_is_idempotent_and_never_overwrites() {
        let root = temp_root("idempotent");
        initialize_at_root(&root)
            .await
            .expect("first init succeeds");
        let config = root.join("config.toml");
        std::fs::write(&config, "# edited\n").expect("edit config");

        let second = initialize_at_root(&root)
            .await
            .expect("second init succeeds");
        assert!(
            second.created.is_empty(),
            "second run should not create files"
        );
        assert_eq!(second.skipped.len(), TEMPLATE_FILES.len());
        assert_eq!(
            std::fs::read_to_string(&config).expect("read config"),
            "# edited\n"
        );

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn bundled_template_parses_but_needs_secrets() {
        let cfg = GatekeepConfig::parse(TEMPLATE_FILES[0].contents).expect("template parses");
        assert_eq!(cfg.spaces.len(), 1);
        assert_eq!(cfg.pool.max_admissions_per_day, 40);
        assert!(cfg.validate().is_err());
    }
}
