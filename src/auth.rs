//! 认证中间件与请求会话。

use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, Request, header};
use axum::{body::Body as AxumBody, middleware, response::Response};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::rules::AccessChecker;
use crate::storage::Storage;
use crate::users::{Directory, Settings, User};

/// 已认证请求的上下文：用户、规则检查器与作用域存储。
#[derive(Debug, Clone)]
pub struct Session {
    pub user: Arc<User>,
    pub checker: AccessChecker,
    pub storage: Arc<Storage>,
}

impl Session {
    pub fn new(user: Arc<User>, settings: Arc<Settings>, storage: Storage) -> Self {
        Self {
            checker: AccessChecker::new(user.clone(), settings),
            user,
            storage: Arc::new(storage),
        }
    }

    /// 规则允许访问该虚拟路径。
    pub fn check(&self, path: &str) -> bool {
        self.checker.check(path)
    }

    /// 需要创建权限且规则允许。
    pub fn require_create(&self, path: &str) -> Result<(), ApiError> {
        if !self.user.perm.create || !self.check(path) {
            return Err(ApiError::Forbidden(format!("access to {path} denied")));
        }
        Ok(())
    }
}

/// 认证中间件：校验 Basic 认证并注入 [`Session`]。
pub async fn auth_middleware(
    Extension(directory): Extension<Arc<Directory>>,
    Extension(storage): Extension<Arc<Storage>>,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if req.method() == Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let user = auth_header.and_then(|TypedHeader(auth_header)| {
        directory.authenticate(auth_header.username(), auth_header.password())
    });
    let Some(user) = user else {
        debug!(path = req.uri().path(), "rejected unauthenticated request");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Basic realm="AxoTransfer""#),
        );
        return Err(ApiError::Unauthorized(headers));
    };

    let scoped = storage.scoped(&user.scope).await.map_err(|err| {
        warn!(user = user.username, error = %err, "user scope unavailable");
        ApiError::from(err)
    })?;
    let session = Session::new(user, directory.settings.clone(), scoped);
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use crate::users::Permissions;
    use tempfile::tempdir;

    fn user(perm: Permissions, rules: Vec<Rule>) -> Arc<User> {
        Arc::new(User {
            username: "alice".into(),
            password: "secret".into(),
            scope: String::new(),
            perm,
            rules,
            hide_dotfiles: true,
        })
    }

    #[test]
    fn require_create_checks_permission_and_rules() {
        let temp = tempdir().expect("tempdir");
        let session = Session::new(
            user(Permissions::all(), vec![Rule::prefix("/locked", false)]),
            Arc::new(Settings::default()),
            Storage::new(temp.path().to_path_buf()),
        );
        assert!(session.require_create("/open/a.bin").is_ok());
        assert!(matches!(
            session.require_create("/locked/a.bin"),
            Err(ApiError::Forbidden(_))
        ));
        assert!(!session.check("/open/.hidden"));

        let read_only = Session::new(
            user(
                Permissions {
                    create: false,
                    modify: false,
                    download: true,
                },
                Vec::new(),
            ),
            Arc::new(Settings::default()),
            Storage::new(temp.path().to_path_buf()),
        );
        assert!(matches!(
            read_only.require_create("/open/a.bin"),
            Err(ApiError::Forbidden(_))
        ));
    }
}
