use crate::orm::{comments, posts};
use crate::user::{authenticate_by_session, ClientUser};
use actix_session::Session;
use actix_utils::future::{ok, Ready};
use actix_web::dev::{
    forward_ready, Extensions, Payload, Service, ServiceRequest, ServiceResponse, Transform,
};
use actix_web::{error, Error, FromRequest, HttpMessage, HttpRequest};
use futures_util::future::{FutureExt as _, LocalBoxFuture};
use std::{cell::RefCell, rc::Rc};

/// Client data stored for a single request cycle.
/// Distinct from ClientCtx because it is defined through request data.
#[derive(Clone, Debug, Default)]
pub struct ClientCtxInner {
    pub client: Option<ClientUser>,
    /// Anonymous viewer id, minted into the session cookie on first contact.
    pub session_id: Option<String>,
}

/// Client context passed to routes.
/// Wraps ClientCtxInner, which is set at the beginning of the request.
#[derive(Clone, Debug, Default)]
pub struct ClientCtx(Rc<RefCell<ClientCtxInner>>);

impl ClientCtx {
    fn get_client_ctx(extensions: &mut Extensions) -> Self {
        match extensions.get::<Rc<RefCell<ClientCtxInner>>>() {
            // Existing record in extensions; pull it.
            Some(s_impl) => Self(Rc::clone(s_impl)),
            // No existing record; create and insert it.
            None => {
                let inner = Rc::new(RefCell::new(ClientCtxInner::default()));
                extensions.insert(inner.clone());
                Self(inner)
            }
        }
    }

    /// Returns either the user's id or None.
    pub fn get_id(&self) -> Option<String> {
        self.0.borrow().client.as_ref().map(|u| u.id.to_owned())
    }

    pub fn get_session_id(&self) -> Option<String> {
        self.0.borrow().session_id.to_owned()
    }

    pub fn is_user(&self) -> bool {
        self.0.borrow().client.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.0
            .borrow()
            .client
            .as_ref()
            .map(|u| u.is_admin)
            .unwrap_or(false)
    }

    /// Returns the authenticated user's id, or a 401.
    pub fn require_user(&self) -> Result<String, Error> {
        self.get_id()
            .ok_or_else(|| error::ErrorUnauthorized("Authentication required."))
    }

    /// Returns a 403 unless the authenticated user carries the admin flag.
    pub fn require_admin(&self) -> Result<(), Error> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(error::ErrorForbidden("Admin access required."))
        }
    }

    pub fn can_modify_post(&self, post: &posts::Model) -> bool {
        self.is_admin() || self.get_id().as_deref() == Some(post.author_id.as_str())
    }

    pub fn can_modify_comment(&self, comment: &comments::Model) -> bool {
        self.is_admin() || self.get_id().as_deref() == Some(comment.author_id.as_str())
    }

    #[cfg(test)]
    pub fn for_test(client: Option<ClientUser>, session_id: Option<String>) -> Self {
        Self(Rc::new(RefCell::new(ClientCtxInner { client, session_id })))
    }
}

/// This implementation is what actually provides the `client: ClientCtx` in the parameters of route functions.
impl FromRequest for ClientCtx {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ok(ClientCtx::get_client_ctx(&mut req.extensions_mut()))
    }
}

impl<S, B> Transform<S, ServiceRequest> for ClientCtx
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = ClientCtxMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ClientCtxMiddleware { service })
    }
}

/// Client context middleware
pub struct ClientCtxMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for ClientCtxMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Borrows of `req` must be done in a precise way to avoid conflicts. This order is important.
        let (httpreq, payload) = req.into_parts();
        let cookies = Session::extract(&httpreq).into_inner();
        let req = ServiceRequest::from_parts(httpreq, payload);
        let ctx = ClientCtx::get_client_ctx(&mut req.extensions_mut());
        let fut = self.service.call(req);

        async move {
            match cookies {
                Ok(cookies) => {
                    let mut inner = ctx.0.borrow_mut();

                    // Assign the user to our ClientCtx struct.
                    inner.client = authenticate_by_session(&cookies).await;

                    // Anonymous clients get a durable viewer id for view dedup.
                    inner.session_id = match cookies.get::<String>("sid") {
                        Ok(Some(sid)) => Some(sid),
                        _ => {
                            let sid = uuid::Uuid::new_v4().to_string();
                            if let Err(e) = cookies.insert("sid", &sid) {
                                log::error!("ClientCtxMiddleware: session insert: {}", e);
                            }
                            Some(sid)
                        }
                    };
                }
                Err(e) => {
                    log::error!("ClientCtxMiddleware: Session::extract(): {}", e);
                }
            };
            fut.await
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str, is_admin: bool) -> ClientUser {
        ClientUser {
            id: id.to_owned(),
            is_admin,
        }
    }

    fn post_by(author_id: &str) -> posts::Model {
        let now = Utc::now().naive_utc();
        posts::Model {
            id: "p1".to_owned(),
            title: "Hi".to_owned(),
            short_description: "".to_owned(),
            content: "".to_owned(),
            cover_image: None,
            author_id: author_id.to_owned(),
            category_id: "c1".to_owned(),
            kind: "post".to_owned(),
            published: true,
            view_count: 0,
            like_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn anonymous_client_has_no_capabilities() {
        let ctx = ClientCtx::for_test(None, Some("sid".to_owned()));
        assert!(!ctx.is_user());
        assert!(ctx.require_user().is_err());
        assert!(ctx.require_admin().is_err());
        assert!(!ctx.can_modify_post(&post_by("a")));
    }

    #[test]
    fn author_can_modify_own_post_only() {
        let ctx = ClientCtx::for_test(Some(user("a", false)), None);
        assert!(ctx.can_modify_post(&post_by("a")));
        assert!(!ctx.can_modify_post(&post_by("b")));
        assert!(ctx.require_admin().is_err());
    }

    #[test]
    fn admin_can_modify_any_post() {
        let ctx = ClientCtx::for_test(Some(user("root", true)), None);
        assert!(ctx.can_modify_post(&post_by("a")));
        assert!(ctx.can_modify_post(&post_by("b")));
        assert!(ctx.require_admin().is_ok());
    }
}
