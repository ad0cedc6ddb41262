use actix_multipart::{Field, Multipart};
use actix_web::{error, Error};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::Path;

/// Fixed upload ceiling, enforced while the multipart stream is read.
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Images and common document types.
const ALLOWED_MIME_TYPES: [&str; 8] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

/// A file persisted to the upload directory.
#[derive(Debug)]
pub struct SavedUpload {
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i32,
}

/// Text fields and saved files split out of a multipart submission.
#[derive(Debug, Default)]
pub struct FormData {
    pub fields: HashMap<String, String>,
    pub files: Vec<SavedUpload>,
}

impl FormData {
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|v| v.as_str())
    }
}

pub fn init() {
    let dir = upload_dir();
    let path = Path::new(&dir);
    if !path.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .create(path)
            .expect("failed to create DIR_UPLOADS");
    }
}

pub fn upload_dir() -> String {
    std::env::var("DIR_UPLOADS").unwrap_or_else(|_| "./uploads".to_owned())
}

pub fn get_file_url_by_filename(filename: &str) -> String {
    format!("/uploads/{}", filename)
}

/// Strips the public URL prefix back to the stored filename.
pub fn filename_from_url(url: &str) -> Option<&str> {
    url.strip_prefix("/uploads/").filter(|f| !f.is_empty())
}

/// Best-effort disk removal after the referencing row is gone. A failure
/// here leaves an orphan, not an inconsistency, so it is only logged.
pub fn remove_upload(filename: &str) {
    let path = Path::new(&upload_dir()).join(filename);
    if let Err(e) = std::fs::remove_file(&path) {
        log::warn!("remove_upload: {}: {}", path.display(), e);
    }
}

fn is_allowed_mime(mime: &mime::Mime) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime.essence_str())
}

/// Random stored name which keeps the original extension so static serving
/// guesses the right content type.
fn storage_filename(original: &str) -> String {
    let uuid = uuid::Uuid::new_v4();
    match Path::new(original).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", uuid, ext),
        None => uuid.to_string(),
    }
}

/// Reads a multipart stream, saving file parts to disk and collecting text
/// parts. Rejects disallowed mime types and oversized payloads.
pub async fn read_form(mut payload: Multipart) -> Result<FormData, Error> {
    let mut form = FormData::default();

    while let Ok(Some(mut field)) = payload.try_next().await {
        let disposition = field.content_disposition();
        let name = disposition
            .get_name()
            .ok_or_else(|| error::ErrorBadRequest("read_form: unnamed multipart field"))?
            .to_owned();
        let filename = disposition.get_filename().map(|f| f.to_owned());

        match filename {
            Some(original_name) => {
                if !is_allowed_mime(field.content_type()) {
                    return Err(error::ErrorBadRequest("Invalid file type."));
                }
                let mime_type = field.content_type().essence_str().to_owned();

                let buf = read_field(&mut field).await?;
                let filename = storage_filename(&original_name);
                let path = Path::new(&upload_dir()).join(&filename);
                let size = buf.len() as i32;

                std::fs::write(&path, &buf).map_err(|e| {
                    log::error!("read_form: failed to write {}: {}", path.display(), e);
                    error::ErrorInternalServerError("Failed to store file.")
                })?;

                form.files.push(SavedUpload {
                    filename,
                    original_name,
                    mime_type,
                    size,
                });
            }
            None => {
                let buf = read_field(&mut field).await?;
                let value = String::from_utf8(buf)
                    .map_err(|_| error::ErrorBadRequest("read_form: field is not utf-8"))?;
                form.fields.insert(name, value);
            }
        }
    }

    Ok(form)
}

async fn read_field(field: &mut Field) -> Result<Vec<u8>, Error> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    while let Some(chunk) = field.next().await {
        let bytes = chunk.map_err(|e| {
            log::error!("read_field: multipart read error: {}", e);
            error::ErrorInternalServerError("Error reading upload data.")
        })?;
        if buf.len() + bytes.len() > MAX_FILE_SIZE {
            return Err(error::ErrorPayloadTooLarge("File exceeds the size limit."));
        }
        buf.extend(bytes);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_allow_list() {
        assert!(is_allowed_mime(&mime::IMAGE_PNG));
        assert!(is_allowed_mime(&mime::APPLICATION_PDF));
        assert!(!is_allowed_mime(&mime::TEXT_HTML));
        let exe: mime::Mime = "application/x-msdownload".parse().unwrap();
        assert!(!is_allowed_mime(&exe));
    }

    #[test]
    fn storage_filename_keeps_extension() {
        let name = storage_filename("photo.JPG");
        assert!(name.ends_with(".JPG"));
        assert_ne!(name, storage_filename("photo.JPG"));
    }

    #[test]
    fn storage_filename_without_extension() {
        let name = storage_filename("README");
        assert!(!name.contains('.'));
    }

    #[test]
    fn filename_round_trips_through_url() {
        let url = get_file_url_by_filename("abc.png");
        assert_eq!(filename_from_url(&url), Some("abc.png"));
        assert_eq!(filename_from_url("/uploads/"), None);
        assert_eq!(filename_from_url("https://cdn.example.com/abc.png"), None);
    }
}
