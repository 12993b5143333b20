use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use libcoedit::{EntityConfig, FieldSpec};

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    #[serde(default)]
    pub entities: Vec<EntityDecl>,
}

/// One entity kind declared in the config file, with optional seed rows
/// inserted at startup.
#[derive(Deserialize, Debug, Clone)]
pub struct EntityDecl {
    #[serde(flatten)]
    pub config: EntityConfig,
    #[serde(default)]
    pub seed: Vec<BTreeMap<String, String>>,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    pub fn default_socket_path() -> PathBuf {
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            PathBuf::from(runtime_dir).join("coedit.sock")
        } else {
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/coedit-{uid}.sock"))
        }
    }

    pub fn pid_file_path() -> PathBuf {
        dirs_path().join("coedit.pid")
    }

    /// The out-of-the-box demo entity: a deck of editable cards.
    fn demo_entities() -> Vec<EntityDecl> {
        let seed = [
            ("Welcome", "This is the first card. Try editing me!"),
            ("Features", "Real-time sync, edit locking, live cursors."),
            ("Instructions", "Click any text to edit. Changes sync to all users."),
        ]
        .into_iter()
        .map(|(title, content)| {
            BTreeMap::from([
                ("title".to_string(), title.to_string()),
                ("content".to_string(), content.to_string()),
            ])
        })
        .collect();

        vec![EntityDecl {
            config: EntityConfig::new(
                "card",
                vec![FieldSpec::text("title"), FieldSpec::long_text("content")],
            ),
            seed,
        }]
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: Self::default_socket_path(),
            entities: Self::demo_entities(),
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("coedit")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("coedit")
    } else {
        PathBuf::from("/tmp/coedit")
    }
}
