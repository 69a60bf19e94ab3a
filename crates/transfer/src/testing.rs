//! In-memory collaborators for handler tests.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tessera_protocol::{
    ResourceInfo, TransferCapabilities, TransmissionCapabilities, UploadToken,
};

use crate::audit::{AuditIncident, Auditor};
use crate::provider::{ResourceReader, StorageProvider, UploadStaging, detect_content_type};
use crate::scheduler::{Job, JobHandle, Scheduler};
use crate::validation::{ancestor_ids, resource_name};
use crate::window::write_window;
use crate::VfsError;

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Storage provider keeping files in a map.
#[derive(Default)]
pub struct MemoryProvider {
    files: Files,
    folders: Mutex<HashSet<String>>,
    /// `(offset, length)` of every staged write, in arrival order.
    writes: Arc<Mutex<Vec<(u64, u64)>>>,
    discarded: Arc<AtomicU64>,
    transmission: TransmissionCapabilities,
}

impl MemoryProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_transmission(transmission: TransmissionCapabilities) -> Arc<Self> {
        Arc::new(Self {
            transmission,
            ..Self::default()
        })
    }

    pub fn add_file(&self, id: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(id.into(), data.to_vec());
    }

    pub fn add_folder(&self, id: &str) {
        self.folders.lock().unwrap().insert(id.into());
    }

    pub fn file(&self, id: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(id).cloned()
    }

    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }
}

impl StorageProvider for MemoryProvider {
    fn resource_info(&self, resource_id: &str) -> Result<Option<ResourceInfo>, VfsError> {
        let name = resource_name(resource_id).to_string();
        if let Some(data) = self.files.lock().unwrap().get(resource_id) {
            return Ok(Some(ResourceInfo {
                resource_id: resource_id.into(),
                content_type: detect_content_type(&name).into(),
                name,
                length: data.len() as u64,
                is_folder: false,
            }));
        }
        if self.folders.lock().unwrap().contains(resource_id) {
            return Ok(Some(ResourceInfo {
                resource_id: resource_id.into(),
                name,
                length: 0,
                content_type: String::new(),
                is_folder: true,
            }));
        }
        Ok(None)
    }

    fn ancestors(&self, resource_id: &str) -> Result<Vec<String>, VfsError> {
        Ok(ancestor_ids(resource_id))
    }

    fn open_read(&self, resource_id: &str) -> Result<Box<dyn ResourceReader>, VfsError> {
        let data = self
            .file(resource_id)
            .ok_or_else(|| VfsError::not_found(resource_id))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn create_staging(&self, token: &UploadToken) -> Result<Box<dyn UploadStaging>, VfsError> {
        Ok(Box::new(MemoryStaging {
            resource_id: token.transfer.resource_id.clone(),
            data: Vec::new(),
            files: Arc::clone(&self.files),
            writes: Arc::clone(&self.writes),
            discarded: Arc::clone(&self.discarded),
        }))
    }

    fn capabilities(&self) -> TransferCapabilities {
        TransferCapabilities {
            max_block_size: u64::MAX,
            max_resource_size: None,
            transmission: self.transmission,
        }
    }
}

struct MemoryStaging {
    resource_id: String,
    data: Vec<u8>,
    files: Files,
    writes: Arc<Mutex<Vec<(u64, u64)>>>,
    discarded: Arc<AtomicU64>,
}

impl UploadStaging for MemoryStaging {
    fn write_at(&mut self, offset: u64, limit: u64, data: &mut dyn Read) -> Result<u64, VfsError> {
        let written = write_window(Cursor::new(&mut self.data), offset, limit, data)?;
        self.writes.lock().unwrap().push((offset, written));
        Ok(written)
    }

    fn suspend(&mut self) -> Result<(), VfsError> {
        Ok(())
    }

    fn open_staged(&mut self) -> Result<Box<dyn ResourceReader>, VfsError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn commit(self: Box<Self>) -> Result<ResourceInfo, VfsError> {
        let length = self.data.len() as u64;
        self.files
            .lock()
            .unwrap()
            .insert(self.resource_id.clone(), self.data);
        Ok(ResourceInfo {
            name: resource_name(&self.resource_id).into(),
            resource_id: self.resource_id,
            length,
            content_type: String::new(),
            is_folder: false,
        })
    }

    fn discard(self: Box<Self>) -> Result<(), VfsError> {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scheduler that only runs jobs when told to.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    jobs: Mutex<Vec<(JobHandle, DateTime<Utc>, Job)>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn deadlines(&self) -> Vec<DateTime<Utc>> {
        self.jobs.lock().unwrap().iter().map(|(_, when, _)| *when).collect()
    }

    /// Runs every pending job, outside the internal lock.
    pub fn fire_all(&self) -> usize {
        let jobs: Vec<_> = self.jobs.lock().unwrap().drain(..).collect();
        let count = jobs.len();
        for (_, _, job) in jobs {
            job();
        }
        count
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, when: DateTime<Utc>, job: Job) -> JobHandle {
        let handle = JobHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().unwrap().push((handle, when, job));
        handle
    }

    fn cancel(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|(h, _, _)| h != handle);
        jobs.len() != before
    }
}

/// Auditor collecting incidents.
#[derive(Default)]
pub struct RecordingAuditor {
    incidents: Mutex<Vec<AuditIncident>>,
}

impl RecordingAuditor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incidents(&self) -> Vec<AuditIncident> {
        self.incidents.lock().unwrap().clone()
    }
}

impl Auditor for RecordingAuditor {
    fn report(&self, incident: AuditIncident) {
        self.incidents.lock().unwrap().push(incident);
    }
}
