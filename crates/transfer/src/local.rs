//! Storage provider over a local directory tree.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tessera_protocol::{ResourceInfo, TransferCapabilities, TransmissionCapabilities, UploadToken};
use tracing::debug;

use crate::config::BLOCK_SIZE_LIMIT;
use crate::provider::{ResourceReader, StorageProvider, UploadStaging, detect_content_type};
use crate::validation::{ancestor_ids, normalize_resource_id, resource_name};
use crate::window::write_window;
use crate::VfsError;

/// Serves resources below `root`. Resource ids are `/`-separated paths
/// relative to the root.
///
/// Uploads are staged in a hidden `.part` file next to the target and
/// renamed over it on commit.
#[derive(Debug, Clone)]
pub struct LocalFileProvider {
    root: PathBuf,
    transmission: TransmissionCapabilities,
}

impl LocalFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            transmission: TransmissionCapabilities::default(),
        }
    }

    /// Overrides the advertised transmission capabilities.
    pub fn with_transmission(mut self, transmission: TransmissionCapabilities) -> Self {
        self.transmission = transmission;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, resource_id: &str) -> Result<(String, PathBuf), VfsError> {
        let id = normalize_resource_id(resource_id)?;
        let path = self.root.join(&id);
        Ok((id, path))
    }
}

fn not_found_or_access(err: io::Error, resource_id: &str) -> VfsError {
    if err.kind() == io::ErrorKind::NotFound {
        VfsError::not_found(resource_id)
    } else {
        err.into()
    }
}

fn info_from_metadata(resource_id: String, meta: &fs::Metadata) -> ResourceInfo {
    let name = resource_name(&resource_id).to_string();
    if meta.is_dir() {
        return ResourceInfo {
            resource_id,
            name,
            length: 0,
            content_type: String::new(),
            is_folder: true,
        };
    }
    let content_type = detect_content_type(&name).to_string();
    ResourceInfo {
        resource_id,
        name,
        length: meta.len(),
        content_type,
        is_folder: false,
    }
}

impl StorageProvider for LocalFileProvider {
    fn resolve_id(&self, resource_id: &str) -> Result<String, VfsError> {
        normalize_resource_id(resource_id)
    }

    fn resource_info(&self, resource_id: &str) -> Result<Option<ResourceInfo>, VfsError> {
        let (id, path) = self.path_of(resource_id)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(info_from_metadata(id, &meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn ancestors(&self, resource_id: &str) -> Result<Vec<String>, VfsError> {
        Ok(ancestor_ids(&normalize_resource_id(resource_id)?))
    }

    fn open_read(&self, resource_id: &str) -> Result<Box<dyn ResourceReader>, VfsError> {
        let (id, path) = self.path_of(resource_id)?;
        let file = File::open(&path).map_err(|e| not_found_or_access(e, &id))?;
        Ok(Box::new(file))
    }

    fn create_staging(&self, token: &UploadToken) -> Result<Box<dyn UploadStaging>, VfsError> {
        let transfer = &token.transfer;
        let (id, target) = self.path_of(&transfer.resource_id)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)?;

        let part = parent.join(format!(
            ".{}.{}.part",
            resource_name(&id),
            transfer.transfer_id
        ));
        let file = open_part(&part, true)?;
        debug!(resource = %id, part = %part.display(), "created staging file");

        Ok(Box::new(LocalStaging {
            resource_id: id,
            content_type: transfer.content_type.clone(),
            target,
            part,
            file: Some(file),
        }))
    }

    fn capabilities(&self) -> TransferCapabilities {
        TransferCapabilities {
            max_block_size: BLOCK_SIZE_LIMIT,
            max_resource_size: None,
            transmission: self.transmission,
        }
    }
}

fn open_part(path: &Path, truncate: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
}

struct LocalStaging {
    resource_id: String,
    content_type: String,
    target: PathBuf,
    part: PathBuf,
    file: Option<File>,
}

impl LocalStaging {
    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(f) => f,
            None => open_part(&self.part, false)?,
        };
        Ok(self.file.insert(file))
    }
}

impl UploadStaging for LocalStaging {
    fn write_at(
        &mut self,
        offset: u64,
        limit: u64,
        data: &mut dyn Read,
    ) -> Result<u64, VfsError> {
        let file = self.file()?;
        write_window(file, offset, limit, data)
    }

    fn suspend(&mut self) -> Result<(), VfsError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn open_staged(&mut self) -> Result<Box<dyn ResourceReader>, VfsError> {
        self.suspend()?;
        Ok(Box::new(File::open(&self.part)?))
    }

    fn commit(mut self: Box<Self>) -> Result<ResourceInfo, VfsError> {
        self.suspend()?;
        fs::rename(&self.part, &self.target)?;
        let meta = fs::metadata(&self.target)?;
        let mut info = info_from_metadata(self.resource_id.clone(), &meta);
        if !self.content_type.is_empty() {
            info.content_type = self.content_type.clone();
        }
        debug!(resource = %self.resource_id, length = info.length, "committed upload");
        Ok(info)
    }

    fn discard(mut self: Box<Self>) -> Result<(), VfsError> {
        self.file = None;
        match fs::remove_file(&self.part) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
