//! Directory-backed remote replica and object store.
//!
//! A development stand-in for the cloud service: several hosts pointed at
//! the same directory share one replica. Layout:
//!
//! ```text
//! {root}/projects/{owner}/{project}/project.json
//! {root}/projects/{owner}/{project}/{collection}.json
//! {root}/objects/{owner}/{project}/{file}
//! ```

use async_trait::async_trait;
use fieldsync_core::model::{CollectionKind, ProjectPatch, ProjectRecord};
use fieldsync_core::remote::Result;
use fieldsync_core::resolver::merge_project_patch;
use fieldsync_core::{ObjectStore, RemoteError, RemoteReplica, StoredObject, VersionedEnvelope};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const PROJECT_FILE: &str = "project.json";

fn io_error(e: std::io::Error) -> RemoteError {
    RemoteError::Service(e.to_string())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(e)),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let contents = serde_json::to_vec_pretty(value)?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, contents).await.map_err(io_error)?;
    fs::rename(&temp, path).await.map_err(io_error)
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(e)),
    }
}

/// Reject path segments that would escape the replica root.
fn checked_segment(segment: &str) -> Result<&str> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(segment),
        _ => Err(RemoteError::Service(format!("invalid path segment: {:?}", segment))),
    }
}

/// Remote replica over a directory of JSON files.
pub struct FileReplica {
    root: PathBuf,
    /// Serializes project read-merge-write cycles within this process.
    project_lock: Mutex<()>,
}

impl FileReplica {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            project_lock: Mutex::new(()),
        }
    }

    fn project_dir(&self, owner: &str, project: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("projects")
            .join(checked_segment(owner)?)
            .join(checked_segment(project)?))
    }

    fn collection_path(&self, owner: &str, project: &str, kind: CollectionKind) -> Result<PathBuf> {
        Ok(self
            .project_dir(owner, project)?
            .join(format!("{}.json", kind.as_str())))
    }
}

#[async_trait]
impl RemoteReplica for FileReplica {
    async fn get_project(
        &self,
        owner: &str,
        project: &str,
    ) -> Result<Option<VersionedEnvelope<ProjectRecord>>> {
        read_json(&self.project_dir(owner, project)?.join(PROJECT_FILE)).await
    }

    async fn put_project(
        &self,
        owner: &str,
        project: &str,
        patch: VersionedEnvelope<ProjectPatch>,
    ) -> Result<()> {
        let path = self.project_dir(owner, project)?.join(PROJECT_FILE);
        let _guard = self.project_lock.lock().await;

        let stored: Option<VersionedEnvelope<ProjectRecord>> = read_json(&path).await?;
        let merged = match stored {
            Some(mut stored) => {
                merge_project_patch(&mut stored.data, &patch.data);
                stored.timestamp = stored.timestamp.max(patch.timestamp);
                stored
            }
            None => {
                let mut record = ProjectRecord::default();
                merge_project_patch(&mut record, &patch.data);
                patch.map(|_| record)
            }
        };
        write_json(&path, &merged).await?;
        debug!("Wrote project record {}/{}", owner, project);
        Ok(())
    }

    async fn get_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
    ) -> Result<Option<VersionedEnvelope<Value>>> {
        read_json(&self.collection_path(owner, project, kind)?).await
    }

    async fn put_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
        envelope: VersionedEnvelope<Value>,
    ) -> Result<()> {
        write_json(&self.collection_path(owner, project, kind)?, &envelope).await?;
        debug!("Wrote {} for {}/{}", kind, owner, project);
        Ok(())
    }

    async fn delete_project(&self, owner: &str, project: &str) -> Result<()> {
        remove_dir_if_exists(&self.project_dir(owner, project)?).await
    }
}

/// Object store over a directory of blobs. URLs are `file://` paths.
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join("objects"),
        }
    }

    fn object_path(&self, path: &str) -> Result<PathBuf> {
        let mut full = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            full.push(checked_segment(segment)?);
        }
        Ok(full)
    }

    fn stored(&self, name: String, full: &Path) -> StoredObject {
        let absolute = std::path::absolute(full).unwrap_or_else(|_| full.to_path_buf());
        StoredObject {
            name,
            url: format!("file://{}", absolute.display()),
        }
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<StoredObject> {
        let full = self.object_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        fs::write(&full, bytes).await.map_err(io_error)?;
        Ok(self.stored(path.to_string(), &full))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        // Walk from the deepest directory the prefix fully names.
        let dir_part = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let mut pending = vec![(self.object_path(dir_part)?, dir_part.to_string())];
        let mut objects = Vec::new();

        while let Some((dir, name_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let name = if name_prefix.is_empty() {
                    file_name
                } else {
                    format!("{}/{}", name_prefix, file_name)
                };
                let file_type = entry.file_type().await.map_err(io_error)?;
                if file_type.is_dir() {
                    pending.push((entry.path(), name));
                } else if name.starts_with(prefix) {
                    objects.push(self.stored(name, &entry.path()));
                }
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for object in self.list(prefix).await? {
            match fs::remove_file(self.object_path(&object.name)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::model::{FormPatch, StampedForm};
    use fieldsync_core::{Timestamp, WriterId};
    use tempfile::TempDir;

    fn envelope<T>(time: u64, data: T) -> VersionedEnvelope<T> {
        VersionedEnvelope::new(Timestamp::new(time, WriterId::from(1)), "owner", "p1", data)
    }

    fn form_patch(patch: FormPatch, time: u64, writer: u64) -> ProjectPatch {
        let mut form = StampedForm::default();
        form.apply_patch(&patch, Timestamp::new(time, WriterId::from(writer)));
        ProjectPatch {
            form: Some(form),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_collection_roundtrip_and_delete() {
        let dir = TempDir::new().unwrap();
        let replica = FileReplica::new(dir.path());

        assert!(
            replica
                .get_collection("owner", "p1", CollectionKind::Images)
                .await
                .unwrap()
                .is_none()
        );

        let stored = envelope(10, serde_json::json!([{"id": "img_1"}]));
        replica
            .put_collection("owner", "p1", CollectionKind::Images, stored.clone())
            .await
            .unwrap();
        let loaded = replica
            .get_collection("owner", "p1", CollectionKind::Images)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, stored);

        replica.delete_project("owner", "p1").await.unwrap();
        assert!(
            replica
                .get_collection("owner", "p1", CollectionKind::Images)
                .await
                .unwrap()
                .is_none()
        );
        // Deleting twice is fine
        replica.delete_project("owner", "p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_project_patches_merge_on_disk() {
        let dir = TempDir::new().unwrap();
        let replica = FileReplica::new(dir.path());

        let elr = FormPatch {
            elr: Some("ABC".into()),
            ..Default::default()
        };
        let structure = FormPatch {
            structure_no: Some("12/3".into()),
            ..Default::default()
        };
        replica
            .put_project("owner", "p1", envelope(5, form_patch(elr, 5, 1)))
            .await
            .unwrap();
        replica
            .put_project("owner", "p1", envelope(6, form_patch(structure, 6, 2)))
            .await
            .unwrap();

        let record = replica.get_project("owner", "p1").await.unwrap().unwrap();
        assert_eq!(record.data.form.data.elr, "ABC");
        assert_eq!(record.data.form.data.structure_no, "12/3");
        assert_eq!(record.timestamp.time, 6);
    }

    #[tokio::test]
    async fn test_rejects_escaping_segments() {
        let dir = TempDir::new().unwrap();
        let replica = FileReplica::new(dir.path());
        assert!(replica.get_project("..", "p1").await.is_err());

        let objects = FileObjectStore::new(dir.path());
        assert!(objects.upload(b"x", "owner/../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_object_store_list_and_delete_prefix() {
        let dir = TempDir::new().unwrap();
        let objects = FileObjectStore::new(dir.path());

        let stored = objects.upload(b"jpeg", "owner/p1/IMG_0001.jpg").await.unwrap();
        assert_eq!(stored.name, "owner/p1/IMG_0001.jpg");
        assert!(stored.url.starts_with("file://"));
        objects.upload(b"jpeg", "owner/p1/IMG_0002.jpg").await.unwrap();
        objects.upload(b"jpeg", "owner/p2/IMG_0001.jpg").await.unwrap();

        let listed = objects.list("owner/p1/").await.unwrap();
        let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["owner/p1/IMG_0001.jpg", "owner/p1/IMG_0002.jpg"]);

        let partial = objects.list("owner/p1/IMG_0002").await.unwrap();
        assert_eq!(partial.len(), 1);

        objects.delete_prefix("owner/p1/").await.unwrap();
        assert!(objects.list("owner/p1/").await.unwrap().is_empty());
        assert_eq!(objects.list("owner/").await.unwrap().len(), 1);
    }
}
