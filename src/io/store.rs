use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::gcs::GcsClient;
use super::uri::{StorageUri, join_key, relative_key};

/// Whether the local source survives a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

/// Destination for run artifacts (tokenizer, checkpoints, weights, logs)
pub trait ArtifactStore {
    /// Transfer `src` (file or directory) to `<dest_dir>/<file name of src>`
    fn write(&self, src: &Path, dest_dir: &str, mode: TransferMode) -> Result<()>;

    fn describe(&self) -> String;
}

/// Every regular file below `dir`, depth first
pub fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).with_context(|| format!("Failed to list {}", current.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn file_name_of(src: &Path) -> Result<String> {
    match src.file_name() {
        Some(name) => Ok(name.to_string_lossy().to_string()),
        None => bail!("cannot transfer {} without a file name", src.display()),
    }
}

/// Delete a file or directory if it exists
pub fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("Failed to delete {}", path.display()))?;
    } else if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))?;
    }
    Ok(())
}

/// Artifact store backed by the local filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalStore;

impl LocalStore {
    fn transfer_file(src: &Path, dest: &Path, mode: TransferMode) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match mode {
            TransferMode::Copy => {
                fs::copy(src, dest)
                    .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
            }
            TransferMode::Move => {
                if fs::rename(src, dest).is_err() {
                    // rename fails across filesystems
                    fs::copy(src, dest)
                        .with_context(|| format!("Failed to move {} to {}", src.display(), dest.display()))?;
                    fs::remove_file(src)?;
                }
            }
        }
        Ok(())
    }
}

impl ArtifactStore for LocalStore {
    fn write(&self, src: &Path, dest_dir: &str, mode: TransferMode) -> Result<()> {
        let dest = PathBuf::from(dest_dir).join(file_name_of(src)?);
        if src.is_dir() {
            for file in walk_files(src)? {
                let rel = file.strip_prefix(src)?;
                Self::transfer_file(&file, &dest.join(rel), mode)?;
            }
            if mode == TransferMode::Move {
                remove_path(src)?;
            }
        } else {
            Self::transfer_file(src, &dest, mode)?;
        }
        log::debug!("{:?} {} -> {}", mode, src.display(), dest.display());
        Ok(())
    }

    fn describe(&self) -> String {
        "local filesystem".to_string()
    }
}

/// Artifact store that uploads into one Cloud Storage bucket
pub struct CloudStore {
    client: Arc<GcsClient>,
    bucket: String,
}

impl CloudStore {
    pub fn new(client: Arc<GcsClient>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Bucket-relative key for a `gs://` or already relative destination
    fn key_prefix(&self, dest_dir: &str) -> Result<String> {
        match StorageUri::parse(dest_dir)? {
            StorageUri::Gcs { bucket, key } if bucket == self.bucket => Ok(key),
            StorageUri::Gcs { bucket, .. } => {
                bail!("destination bucket {} does not match store bucket {}", bucket, self.bucket)
            }
            StorageUri::Local(path) => Ok(path.to_string_lossy().trim_matches('/').to_string()),
        }
    }
}

impl ArtifactStore for CloudStore {
    fn write(&self, src: &Path, dest_dir: &str, mode: TransferMode) -> Result<()> {
        let base = join_key(&self.key_prefix(dest_dir)?, &file_name_of(src)?);
        if src.is_dir() {
            for file in walk_files(src)? {
                let rel = relative_key(src, &file).unwrap_or_else(|| file.to_string_lossy().to_string());
                self.client.upload_file(&self.bucket, &join_key(&base, &rel), &file)?;
            }
        } else {
            self.client.upload_file(&self.bucket, &base, src)?;
        }
        if mode == TransferMode::Move {
            remove_path(src)?;
        }
        log::debug!("{:?} {} -> gs://{}/{}", mode, src.display(), self.bucket, base);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("gs://{}", self.bucket)
    }
}

/// A local copy of an artifact and whether it was downloaded
#[derive(Debug, Clone)]
pub struct Fetched {
    pub path: PathBuf,
    pub downloaded: bool,
}

/// Make `location` available locally.
///
/// Local paths are returned untouched. A `gs://` object is downloaded into
/// `local_dir`; if no object matches exactly, every object under the prefix
/// is downloaded into `local_dir/<last segment>/`.
pub fn fetch(location: &str, local_dir: &Path, client: Option<&GcsClient>) -> Result<Fetched> {
    let (bucket, key) = match StorageUri::parse(location)? {
        StorageUri::Local(path) => return Ok(Fetched { path, downloaded: false }),
        StorageUri::Gcs { bucket, key } => (bucket, key),
    };

    let owned;
    let client = match client {
        Some(client) => client,
        None => {
            owned = GcsClient::from_env()?;
            &owned
        }
    };

    let name = key.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(bucket.as_str()).to_string();
    let dest = local_dir.join(&name);
    log::info!("Copying {} to {}", location, dest.display());

    let objects = client.list_objects(&bucket, &key)?;
    if objects.iter().any(|o| o == &key) {
        client.download_object(&bucket, &key, &dest)?;
    } else {
        let prefix = if key.is_empty() { String::new() } else { format!("{}/", key) };
        let mut count = 0;
        for object in objects.iter().filter(|o| o.starts_with(&prefix) && !o.ends_with('/')) {
            client.download_object(&bucket, object, &dest.join(&object[prefix.len()..]))?;
            count += 1;
        }
        if count == 0 {
            bail!("no objects found at {}", location);
        }
    }
    Ok(Fetched { path: dest, downloaded: true })
}

/// Read a small text artifact, such as a run config, from a path or `gs://` object
pub fn read_text(location: &str, client: Option<&GcsClient>) -> Result<String> {
    let bytes = match StorageUri::parse(location)? {
        StorageUri::Local(path) => {
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?
        }
        StorageUri::Gcs { bucket, key } => match client {
            Some(client) => client.read_object(&bucket, &key)?,
            None => GcsClient::from_env()?.read_object(&bucket, &key)?,
        },
    };
    String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", location))
}

/// Upload or copy a single local file to an exact destination
pub fn put_file(src: &Path, location: &str, client: Option<&GcsClient>) -> Result<()> {
    match StorageUri::parse(location)? {
        StorageUri::Local(dest) => {
            if dest != src {
                if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(src, &dest)?;
            }
        }
        StorageUri::Gcs { bucket, key } => match client {
            Some(client) => client.upload_file(&bucket, &key, src)?,
            None => GcsClient::from_env()?.upload_file(&bucket, &key, src)?,
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::FakeGcs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_local_move_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("trained_model");
        write(&src.join("CNN_model.safetensors"), "w");
        write(&src.join("nested").join("extra.txt"), "x");
        let out = dir.path().join("run");

        LocalStore.write(&src, out.to_str().unwrap(), TransferMode::Move).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(out.join("trained_model/CNN_model.safetensors")).unwrap(), "w");
        assert!(out.join("trained_model/nested/extra.txt").is_file());
    }

    #[test]
    fn test_local_copy_file_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("train_logs.csv");
        write(&src, "epoch,loss\n");
        let out = dir.path().join("run").join("checkpoints");

        LocalStore.write(&src, out.to_str().unwrap(), TransferMode::Copy).unwrap();
        LocalStore.write(&src, out.to_str().unwrap(), TransferMode::Copy).unwrap();

        assert!(src.exists());
        assert!(out.join("train_logs.csv").is_file());
    }

    #[test]
    fn test_fetch_local_is_passthrough() {
        let fetched = fetch("data/test.csv", Path::new("/tmp"), None).unwrap();
        assert_eq!(fetched.path, PathBuf::from("data/test.csv"));
        assert!(!fetched.downloaded);
    }

    #[test]
    fn test_put_file_local() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("results.csv");
        write(&src, "input,predictions\n");
        let dest = dir.path().join("out").join("final.csv");
        put_file(&src, dest.to_str().unwrap(), None).unwrap();
        assert!(dest.is_file());
    }

    #[test]
    fn test_cloud_key_prefix() {
        let client = Arc::new(GcsClient::new("http://localhost:4443", None).unwrap());
        let store = CloudStore::new(client, "reviews");
        assert_eq!(store.key_prefix("gs://reviews/out/CNN_run").unwrap(), "out/CNN_run");
        assert_eq!(store.key_prefix("out/CNN_run/").unwrap(), "out/CNN_run");
        assert!(store.key_prefix("gs://other/out").is_err());
    }

    #[test]
    fn test_walk_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("b.txt"), "");
        write(&dir.path().join("a/c.txt"), "");
        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("a/c.txt"), dir.path().join("b.txt")]);
    }

    #[test]
    fn test_cloud_move_directory_uploads_every_file() {
        let server = FakeGcs::start();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("trained_model");
        write(&src.join("CNN_model.safetensors"), "weights");
        write(&src.join("nested").join("extra.txt"), "x");

        let store = CloudStore::new(Arc::new(server.client()), "reviews");
        store.write(&src, "gs://reviews/out/CNN_run", TransferMode::Move).unwrap();

        assert_eq!(
            server.names("reviews"),
            vec![
                "out/CNN_run/trained_model/CNN_model.safetensors".to_string(),
                "out/CNN_run/trained_model/nested/extra.txt".to_string(),
            ]
        );
        assert_eq!(
            server.object("reviews", "out/CNN_run/trained_model/CNN_model.safetensors").unwrap(),
            b"weights"
        );
        assert!(!src.exists());

        let uploads = server.requests();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|r| r.method == "POST" && r.path() == "/upload/storage/v1/b/reviews/o"));
        assert!(uploads.iter().all(|r| r.query("uploadType").as_deref() == Some("media")));
    }

    #[test]
    fn test_cloud_copy_file_keeps_source() {
        let server = FakeGcs::start();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("train_logs.csv");
        write(&src, "epoch,loss\n");

        let store = CloudStore::new(Arc::new(server.client()), "reviews");
        store.write(&src, "out/run", TransferMode::Copy).unwrap();

        assert!(src.is_file());
        assert_eq!(server.object("reviews", "out/run/train_logs.csv").unwrap(), b"epoch,loss\n");
    }

    #[test]
    fn test_fetch_exact_object() {
        let server = FakeGcs::start();
        server.insert("reviews", "data/train_val.zip", b"zip bytes");
        server.insert("reviews", "data/train_val.zip.bak", b"old");
        let client = server.client();
        let dir = tempfile::tempdir().unwrap();

        let fetched = fetch("gs://reviews/data/train_val.zip", dir.path(), Some(&client)).unwrap();

        assert!(fetched.downloaded);
        assert_eq!(fetched.path, dir.path().join("train_val.zip"));
        assert_eq!(fs::read(&fetched.path).unwrap(), b"zip bytes");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let requests = server.requests();
        assert_eq!(requests[0].query("prefix").as_deref(), Some("data/train_val.zip"));
        let download = requests.last().unwrap();
        assert_eq!(download.path(), "/storage/v1/b/reviews/o/data%2Ftrain_val.zip");
        assert_eq!(download.query("alt").as_deref(), Some("media"));
    }

    #[test]
    fn test_fetch_prefix_downloads_directory() {
        let server = FakeGcs::start();
        server.insert("reviews", "runs/CNN/parser_output/tokenizer.json", b"{}");
        server.insert("reviews", "runs/CNN/parser_output/word_index.txt", b"good:1\n");
        server.insert("reviews", "runs/CNN/parser_output_old/tokenizer.json", b"stale");
        let client = server.client();
        let dir = tempfile::tempdir().unwrap();

        let fetched = fetch("gs://reviews/runs/CNN/parser_output/", dir.path(), Some(&client)).unwrap();

        assert_eq!(fetched.path, dir.path().join("parser_output"));
        assert_eq!(fs::read(fetched.path.join("tokenizer.json")).unwrap(), b"{}");
        assert_eq!(fs::read(fetched.path.join("word_index.txt")).unwrap(), b"good:1\n");
        assert!(!dir.path().join("parser_output_old").exists());
        assert_eq!(walk_files(&fetched.path).unwrap().len(), 2);

        assert!(fetch("gs://reviews/runs/LSTM", dir.path(), Some(&client)).is_err());
    }

    #[test]
    fn test_read_text_from_bucket_and_disk() {
        let server = FakeGcs::start();
        server.insert("configs", "jobs/train.yaml", b"train_type: managed\n");
        let client = server.client();
        assert_eq!(
            read_text("gs://configs/jobs/train.yaml", Some(&client)).unwrap(),
            "train_type: managed\n"
        );
        assert!(read_text("gs://configs/jobs/missing.yaml", Some(&client)).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        write(&path, "train_type: local\n");
        assert_eq!(read_text(path.to_str().unwrap(), None).unwrap(), "train_type: local\n");
    }
}
