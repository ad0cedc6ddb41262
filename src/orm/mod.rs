pub mod categories;
pub mod comments;
pub mod post_files;
pub mod post_likes;
pub mod post_views;
pub mod posts;
pub mod site_settings;
pub mod users;
