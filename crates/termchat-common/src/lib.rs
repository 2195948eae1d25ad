pub mod config;
pub mod logging;

pub const APP_NAME: &str = "termchat";

pub use config::{
    ConfigError, KeyStoreConfig, ModelConfig, ProfileConfig, ProjectEntry, ServerConfig,
    SocialLink, TermchatConfig,
};
