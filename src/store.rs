use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::hash_password;
use crate::error::AppError;
use crate::models::{format_size, File};

const HOTLINK_ID_LENGTH: usize = 40;
const META_DIR: &str = ".meta";
const STAGING_DIR: &str = ".staging";

/// Parameters of a new upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub content_type: Option<String>,
    pub expiry_days: u32,
    pub allowed_downloads: i32,
    pub password: Option<String>,
}

impl UploadRequest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            content_type: None,
            expiry_days: 14,
            allowed_downloads: 1,
            password: None,
        }
    }
}

/// Local-disk file store. Content is kept under its SHA-256, metadata in `.meta/<id>.json`.
pub struct FileStore {
    root: PathBuf,
    length_id: usize,
    salt_files: String,
    /// In-memory index of all records (persisted to disk)
    files: RwLock<HashMap<String, File>>,
}

impl FileStore {
    /// Open the store, creating the data directory if needed
    pub fn new(root: &str, length_id: usize, salt_files: &str) -> Result<Self, AppError> {
        let root = PathBuf::from(root);
        fs::create_dir_all(root.join(META_DIR))
            .map_err(|e| AppError::StorageError(format!("Cannot create data dir: {}", e)))?;

        // leftovers of interrupted uploads
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let store = Self {
            root,
            length_id,
            salt_files: salt_files.to_string(),
            files: RwLock::new(HashMap::new()),
        };
        store.scan_metadata()?;
        Ok(store)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, HashMap<String, File>> {
        self.files.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, HashMap<String, File>> {
        self.files.write().unwrap_or_else(|e| e.into_inner())
    }

    fn scan_metadata(&self) -> Result<(), AppError> {
        let mut files = self.write_index();
        for entry in fs::read_dir(self.root.join(META_DIR))?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match fs::read_to_string(&path) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Skipping unreadable metadata {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<File>(&data) {
                Ok(file) => {
                    files.insert(file.id.clone(), file);
                }
                Err(e) => tracing::warn!("Skipping corrupt metadata {}: {}", path.display(), e),
            }
        }
        tracing::debug!("Loaded {} file record(s)", files.len());
        Ok(())
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", id))
    }

    pub fn content_path(&self, file: &File) -> PathBuf {
        self.root.join(&file.sha256)
    }

    fn persist(&self, file: &File) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(file)
            .map_err(|e| AppError::StorageError(format!("Cannot encode metadata: {}", e)))?;
        fs::write(self.meta_path(&file.id), json)?;
        Ok(())
    }

    pub fn put_file(&self, upload: &UploadRequest, data: &[u8]) -> Result<File, AppError> {
        validate(upload)?;

        let mut hasher = Sha256::new();
        hasher.update(data);
        let sha256 = hex::encode(hasher.finalize());

        self.insert_record(upload, &sha256, data.len() as u64, |path| fs::write(path, data))
    }

    /// Start writing an upload to the staging area. At most `buffer_limit` bytes
    /// are held in memory at a time.
    pub async fn stage_upload(&self, buffer_limit: usize) -> Result<StagedUpload, AppError> {
        let path = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok(StagedUpload {
            path,
            file,
            hasher: Sha256::new(),
            buffer: BytesMut::new(),
            buffer_limit: buffer_limit.max(1),
            size: 0,
        })
    }

    /// Turn fully staged content into a stored file
    pub fn put_staged(
        &self,
        upload: &UploadRequest,
        staged: StagedContent,
    ) -> Result<File, AppError> {
        validate(upload)?;
        self.insert_record(upload, &staged.sha256, staged.size, |path| {
            fs::rename(&staged.path, path)
        })
    }

    /// Content check, content write and index insert happen under one write lock,
    /// so a concurrent delete of the same hash cannot remove the blob in between.
    fn insert_record(
        &self,
        upload: &UploadRequest,
        sha256: &str,
        size: u64,
        write_content: impl FnOnce(&Path) -> std::io::Result<()>,
    ) -> Result<File, AppError> {
        let content_type = upload
            .content_type
            .clone()
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&upload.name)
                    .first_or_octet_stream()
                    .to_string()
            });

        let expire = Utc::now() + Duration::days(i64::from(upload.expiry_days));
        let password_hash = match upload.password.as_deref() {
            Some(pw) if !pw.is_empty() => hash_password(&self.salt_files, pw),
            _ => String::new(),
        };
        let hotlink_id = if content_type.starts_with("image/") {
            let ext = Path::new(&upload.name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            format!("{}{}", generate_id(HOTLINK_ID_LENGTH), ext)
        } else {
            String::new()
        };

        let mut files = self.write_index();

        let content_path = self.root.join(sha256);
        if !content_path.exists() {
            write_content(&content_path)?;
        }

        let file = File {
            id: unused_id(&files, self.length_id),
            name: upload.name.clone(),
            size: format_size(size),
            sha256: sha256.to_string(),
            expire_at: expire.timestamp(),
            expire_at_string: expire.format("%Y-%m-%d %H:%M").to_string(),
            downloads_remaining: upload.allowed_downloads,
            password_hash,
            hotlink_id,
            content_type,
            aws_bucket: String::new(),
        };

        self.persist(&file)?;
        files.insert(file.id.clone(), file.clone());
        drop(files);

        tracing::info!("Stored file: {} ({}, id {})", file.name, file.size, file.id);
        Ok(file)
    }

    pub fn get_file(&self, id: &str) -> Result<File, AppError> {
        self.read_index()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::FileNotFound(id.to_string()))
    }

    pub fn get_by_hotlink(&self, hotlink_id: &str) -> Result<File, AppError> {
        if hotlink_id.is_empty() {
            return Err(AppError::FileNotFound(hotlink_id.to_string()));
        }
        self.read_index()
            .values()
            .find(|f| f.hotlink_id == hotlink_id)
            .cloned()
            .ok_or_else(|| AppError::FileNotFound(hotlink_id.to_string()))
    }

    /// All records, soonest expiry first
    pub fn list_files(&self) -> Vec<File> {
        let mut list: Vec<File> = self.read_index().values().cloned().collect();
        list.sort_by(|a, b| a.expire_at.cmp(&b.expire_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn check_password(&self, file: &File, password: &str) -> bool {
        file.password_hash.is_empty()
            || hash_password(&self.salt_files, password) == file.password_hash
    }

    /// Counts one download. Expired files are reported as missing; a file whose
    /// last download was just used stays on disk until the next cleanup.
    pub fn register_download(&self, id: &str) -> Result<File, AppError> {
        let now = Utc::now().timestamp();
        let mut files = self.write_index();
        let file = files
            .get_mut(id)
            .filter(|f| !f.is_expired(now))
            .ok_or_else(|| AppError::FileNotFound(id.to_string()))?;

        file.downloads_remaining -= 1;
        let file = file.clone();
        drop(files);

        self.persist(&file)?;
        tracing::info!("Download of {} ({} remaining)", file.id, file.downloads_remaining);
        Ok(file)
    }

    pub fn delete_file(&self, id: &str) -> Result<(), AppError> {
        let mut files = self.write_index();
        let file = files
            .remove(id)
            .ok_or_else(|| AppError::FileNotFound(id.to_string()))?;
        let shared = files.values().any(|f| f.sha256 == file.sha256);

        let meta_path = self.meta_path(id);
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }
        let content_path = self.content_path(&file);
        if !shared && content_path.exists() {
            fs::remove_file(&content_path)?;
        }
        drop(files);

        tracing::info!("Deleted file: {} ({})", file.name, id);
        Ok(())
    }

    /// Deletes every expired record, returning how many were removed
    pub fn cleanup_expired(&self, now: i64) -> Result<usize, AppError> {
        let expired: Vec<String> = self
            .read_index()
            .values()
            .filter(|f| f.is_expired(now))
            .map(|f| f.id.clone())
            .collect();

        for id in &expired {
            self.delete_file(id)?;
        }
        Ok(expired.len())
    }
}

fn validate(upload: &UploadRequest) -> Result<(), AppError> {
    if upload.name.is_empty() {
        return Err(AppError::InvalidUpload("File name must not be empty".to_string()));
    }
    if upload.expiry_days < 1 {
        return Err(AppError::InvalidUpload("Expiry must be at least one day".to_string()));
    }
    if upload.allowed_downloads < 1 {
        return Err(AppError::InvalidUpload(
            "At least one download must be allowed".to_string(),
        ));
    }
    Ok(())
}

fn unused_id(files: &HashMap<String, File>, length: usize) -> String {
    loop {
        let id = generate_id(length);
        if !files.contains_key(&id) {
            return id;
        }
    }
}

/// An upload being written to the staging area. Hashes content as it arrives.
/// The partial file is removed if the upload is dropped before [`finish`](Self::finish).
pub struct StagedUpload {
    path: PathBuf,
    file: tokio::fs::File,
    hasher: Sha256,
    buffer: BytesMut,
    buffer_limit: usize,
    size: u64,
}

impl StagedUpload {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AppError> {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= self.buffer_limit {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AppError> {
        self.file.write_all(&self.buffer).await?;
        self.buffer.clear();
        Ok(())
    }

    pub async fn finish(mut self) -> Result<StagedContent, AppError> {
        self.flush().await?;
        self.file.flush().await?;
        Ok(StagedContent {
            path: std::mem::take(&mut self.path),
            sha256: hex::encode(self.hasher.clone().finalize()),
            size: self.size,
        })
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Completely written upload waiting to be stored
pub struct StagedContent {
    path: PathBuf,
    sha256: String,
    size: u64,
}

impl Drop for StagedContent {
    fn drop(&mut self) {
        // already moved into place unless the content existed or storing failed
        let _ = fs::remove_file(&self.path);
    }
}

/// Random URL-safe id of exactly `length` characters
pub fn generate_id(length: usize) -> String {
    let mut id = String::with_capacity(length + 22);
    while id.len() < length {
        id.push_str(&URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes()));
    }
    id.truncate(length);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, FileStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_str().unwrap(), 15, "filesalt").unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_generate_id_length() {
        for length in [5, 15, 22, 23, 64] {
            let id = generate_id(length);
            assert_eq!(id.len(), length);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        assert_ne!(generate_id(15), generate_id(15));
    }

    #[test]
    fn test_put_and_get() {
        let (_temp_dir, store) = setup_store();
        let file = store.put_file(&UploadRequest::new("notes.txt"), b"0123456789").unwrap();

        assert_eq!(file.id.len(), 15);
        assert_eq!(file.size, "10 B");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.downloads_remaining, 1);
        assert_eq!(file.hotlink_id, "");
        assert_eq!(file.password_hash, "");
        assert_eq!(file.aws_bucket, "");
        assert_eq!(
            file.sha256,
            "84d89877f0d4041efb6bf91a16f0248f2fd573e6af05c19f96bedb9f882f7882"
        );
        assert!(file.expire_at > Utc::now().timestamp());
        assert_eq!(fs::read(store.content_path(&file)).unwrap(), b"0123456789");
        assert_eq!(store.get_file(&file.id).unwrap(), file);
    }

    #[test]
    fn test_put_rejects_invalid_uploads() {
        let (_temp_dir, store) = setup_store();

        let mut upload = UploadRequest::new("a.txt");
        upload.allowed_downloads = 0;
        assert!(matches!(store.put_file(&upload, b"x"), Err(AppError::InvalidUpload(_))));

        let mut upload = UploadRequest::new("a.txt");
        upload.expiry_days = 0;
        assert!(matches!(store.put_file(&upload, b"x"), Err(AppError::InvalidUpload(_))));

        assert!(store.put_file(&UploadRequest::new(""), b"x").is_err());
    }

    #[test]
    fn test_images_get_hotlink() {
        let (_temp_dir, store) = setup_store();
        let file = store.put_file(&UploadRequest::new("cat.png"), b"png").unwrap();

        assert_eq!(file.content_type, "image/png");
        assert!(file.hotlink_id.ends_with(".png"));
        assert_eq!(file.hotlink_id.len(), HOTLINK_ID_LENGTH + 4);
        assert_eq!(store.get_by_hotlink(&file.hotlink_id).unwrap().id, file.id);
        assert!(store.get_by_hotlink("").is_err());
    }

    #[test]
    fn test_password_check() {
        let (_temp_dir, store) = setup_store();
        let mut upload = UploadRequest::new("secret.txt");
        upload.password = Some("open sesame".to_string());
        let file = store.put_file(&upload, b"data").unwrap();

        assert_eq!(file.password_hash, hash_password("filesalt", "open sesame"));
        assert!(store.check_password(&file, "open sesame"));
        assert!(!store.check_password(&file, "wrong"));

        let open = store.put_file(&UploadRequest::new("open.txt"), b"data").unwrap();
        assert!(store.check_password(&open, ""));
    }

    #[test]
    fn test_register_download_counts_down() {
        let (_temp_dir, store) = setup_store();
        let mut upload = UploadRequest::new("a.bin");
        upload.allowed_downloads = 2;
        let file = store.put_file(&upload, b"abc").unwrap();

        assert_eq!(store.register_download(&file.id).unwrap().downloads_remaining, 1);
        assert_eq!(store.register_download(&file.id).unwrap().downloads_remaining, 0);
        assert!(matches!(
            store.register_download(&file.id),
            Err(AppError::FileNotFound(_))
        ));

        let removed = store.cleanup_expired(Utc::now().timestamp()).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_file(&file.id).is_err());
        assert!(!store.content_path(&file).exists());
    }

    #[test]
    fn test_cleanup_by_time() {
        let (_temp_dir, store) = setup_store();
        let file = store.put_file(&UploadRequest::new("a.txt"), b"abc").unwrap();

        assert_eq!(store.cleanup_expired(Utc::now().timestamp()).unwrap(), 0);
        assert_eq!(store.cleanup_expired(file.expire_at).unwrap(), 1);
        assert!(store.list_files().is_empty());
    }

    #[test]
    fn test_delete_keeps_shared_content() {
        let (_temp_dir, store) = setup_store();
        let first = store.put_file(&UploadRequest::new("a.txt"), b"same").unwrap();
        let second = store.put_file(&UploadRequest::new("b.txt"), b"same").unwrap();
        assert_eq!(first.sha256, second.sha256);

        store.delete_file(&first.id).unwrap();
        assert!(store.content_path(&second).exists());

        store.delete_file(&second.id).unwrap();
        assert!(!store.content_path(&second).exists());
        assert!(matches!(store.delete_file(&second.id), Err(AppError::FileNotFound(_))));
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_str().unwrap();

        let file = {
            let store = FileStore::new(path, 8, "").unwrap();
            store.put_file(&UploadRequest::new("keep.txt"), b"keep").unwrap()
        };

        fs::write(temp_dir.path().join(META_DIR).join("broken.json"), "{").unwrap();
        fs::write(temp_dir.path().join(META_DIR).join("binary.json"), [0xff, 0xfe, 0x00]).unwrap();

        let store = FileStore::new(path, 8, "").unwrap();
        assert_eq!(store.list_files(), vec![file]);
    }

    #[tokio::test]
    async fn test_staged_upload_flushes_in_chunks() {
        let (temp_dir, store) = setup_store();
        let mut staged = store.stage_upload(4).await.unwrap();
        let chunks: [&[u8]; 3] = [b"0123", b"45", b"6789"];
        for chunk in chunks {
            staged.write_chunk(chunk).await.unwrap();
        }
        let content = staged.finish().await.unwrap();

        let file = store.put_staged(&UploadRequest::new("notes.txt"), content).unwrap();
        assert_eq!(file.size, "10 B");
        assert_eq!(
            file.sha256,
            "84d89877f0d4041efb6bf91a16f0248f2fd573e6af05c19f96bedb9f882f7882"
        );
        assert_eq!(fs::read(store.content_path(&file)).unwrap(), b"0123456789");
        assert_eq!(fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_staged_upload_cleaned_up_when_rejected() {
        let (temp_dir, store) = setup_store();
        let existing = store.put_file(&UploadRequest::new("a.txt"), b"same").unwrap();

        let mut staged = store.stage_upload(1024).await.unwrap();
        staged.write_chunk(b"same").await.unwrap();
        let content = staged.finish().await.unwrap();
        let second = store.put_staged(&UploadRequest::new("b.txt"), content).unwrap();
        assert_eq!(second.sha256, existing.sha256);

        let mut staged = store.stage_upload(1024).await.unwrap();
        staged.write_chunk(b"other").await.unwrap();
        let content = staged.finish().await.unwrap();
        let mut upload = UploadRequest::new("c.txt");
        upload.allowed_downloads = 0;
        assert!(store.put_staged(&upload, content).is_err());

        let abandoned = store.stage_upload(1024).await.unwrap();
        drop(abandoned);

        assert_eq!(fs::read_dir(temp_dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_put_and_delete_keep_content() {
        let (_temp_dir, store) = setup_store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let file = store.put_file(&UploadRequest::new("a.txt"), b"same").unwrap();
                        assert!(store.content_path(&file).exists());
                        store.delete_file(&file.id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(store.list_files().is_empty());
    }
}
