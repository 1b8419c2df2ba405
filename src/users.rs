//! 用户目录：凭据、权限、作用域与全局规则。

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

use crate::rules::Rule;

#[derive(Debug, Clone, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub modify: bool,
    #[serde(default)]
    pub download: bool,
}

impl Permissions {
    pub fn all() -> Self {
        Self {
            create: true,
            modify: true,
            download: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    /// 相对存储根目录的用户作用域，空串表示整个存储根。
    #[serde(default)]
    pub scope: String,
    #[serde(default = "Permissions::all")]
    pub perm: Permissions,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub hide_dotfiles: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    settings: Settings,
    users: Vec<User>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read users file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse users file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate user `{0}`")]
    DuplicateUser(String),
}

/// 用户与全局设置的只读目录。
#[derive(Debug)]
pub struct Directory {
    pub settings: Arc<Settings>,
    users: HashMap<String, Arc<User>>,
}

impl Directory {
    /// 以单个全权限用户构建目录（未提供用户文件时使用）。
    pub fn single(username: &str, password: &str) -> Self {
        let user = User {
            username: username.to_string(),
            password: password.to_string(),
            scope: String::new(),
            perm: Permissions::all(),
            rules: Vec::new(),
            hide_dotfiles: false,
        };
        let mut users = HashMap::new();
        users.insert(user.username.clone(), Arc::new(user));
        Self {
            settings: Arc::new(Settings::default()),
            users,
        }
    }

    /// 从 JSON 文件加载用户与全局规则。
    pub async fn load(path: &Path) -> Result<Self, DirectoryError> {
        let bytes = fs::read(path).await?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = serde_json::from_slice(bytes)?;
        let mut users = HashMap::new();
        for user in file.users {
            if users.contains_key(&user.username) {
                return Err(DirectoryError::DuplicateUser(user.username));
            }
            users.insert(user.username.clone(), Arc::new(user));
        }
        Ok(Self {
            settings: Arc::new(file.settings),
            users,
        })
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<Arc<User>> {
        self.users
            .get(username)
            .filter(|user| user.password == password)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_users_and_global_rules() {
        let json = br#"{
            "settings": { "rules": [ { "path": "/shared/locked", "allow": false } ] },
            "users": [
                {
                    "username": "alice",
                    "password": "secret",
                    "scope": "alice",
                    "perm": { "create": true, "modify": false, "download": true },
                    "rules": [ { "regex": "\\.tmp$", "allow": false } ],
                    "hide_dotfiles": true
                },
                { "username": "bob", "password": "hunter2" }
            ]
        }"#;
        let directory = Directory::from_slice(json).expect("parse directory");
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.settings.rules.len(), 1);

        let alice = directory.authenticate("alice", "secret").expect("alice");
        assert_eq!(alice.scope, "alice");
        assert!(alice.perm.create);
        assert!(!alice.perm.modify);
        assert!(alice.hide_dotfiles);

        let bob = directory.authenticate("bob", "hunter2").expect("bob");
        assert!(bob.perm.modify, "missing perm block grants everything");
        assert!(directory.authenticate("bob", "wrong").is_none());
        assert!(directory.authenticate("carol", "x").is_none());
    }

    #[test]
    fn rejects_duplicate_usernames() {
        let json = br#"{ "users": [
            { "username": "a", "password": "1" },
            { "username": "a", "password": "2" }
        ] }"#;
        let result = Directory::from_slice(json);
        assert!(matches!(result, Err(DirectoryError::DuplicateUser(name)) if name == "a"));
    }
}
