pub mod error;

/// Configures the web app
///
/// @see https://docs.rs/actix-web/4.0.1/actix_web/struct.App.html#method.configure
pub fn configure(conf: &mut actix_web::web::ServiceConfig) {
    // Services are matched in registration order; literal paths such as
    // /api/posts/my-posts must come before /api/posts/{post_id}.
    conf.service(crate::user::post_login)
        .service(crate::user::post_logout)
        .service(crate::user::view_current_user)
        .service(crate::user::update_profile)
        .service(crate::category::view_categories)
        .service(crate::category::create_category)
        .service(crate::category::update_category)
        .service(crate::category::delete_category)
        .service(crate::post::view_posts)
        .service(crate::post::view_my_posts)
        .service(crate::post::create_post)
        .service(crate::post::create_article)
        .service(crate::post::view_post)
        .service(crate::post::update_post)
        .service(crate::post::destroy_post)
        .service(crate::post::add_post_files)
        .service(crate::post::destroy_post_file)
        .service(crate::engagement::like_post)
        .service(crate::comment::view_comments)
        .service(crate::comment::create_comment)
        .service(crate::comment::destroy_comment)
        .service(crate::settings::view_setting)
        .service(crate::settings::update_setting)
        .service(crate::admin::view_users)
        .service(crate::admin::update_user_admin)
        .service(crate::mail::post_contact);
}
