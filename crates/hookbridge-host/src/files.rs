//! Record attachment storage.
//!
//! Files live at `{root}/{collection}/{recordId}/{filename}`.  Every path
//! component is checked again here, independent of payload validation, so a
//! crafted name can never escape the root.  Writes go to a temporary file in
//! the same directory and are renamed into place.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use hookbridge_protocol::schema::is_path_segment;
use tracing::debug;

use crate::config::FilesConfig;
use crate::error::Fault;

pub struct FileStore {
    root: PathBuf,
    max_bytes: usize,
}

impl FileStore {
    pub fn new(config: &FilesConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_bytes: config.max_bytes,
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn path_of(&self, collection: &str, record_id: &str, filename: &str) -> Result<PathBuf, Fault> {
        for (field, segment) in [
            ("collection", collection),
            ("recordId", record_id),
            ("filename", filename),
        ] {
            if !is_path_segment(segment) {
                return Err(Fault::invalid(field, "must be a single path segment"));
            }
        }
        Ok(self.root.join(collection).join(record_id).join(filename))
    }

    /// Store `bytes`, replacing any previous file of the same name.
    pub fn save(
        &self,
        collection: &str,
        record_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<usize, Fault> {
        if bytes.len() > self.max_bytes {
            return Err(Fault::invalid(
                "data",
                format!("file of {} bytes exceeds limit of {}", bytes.len(), self.max_bytes),
            ));
        }
        let path = self.path_of(collection, record_id, filename)?;
        let dir = path
            .parent()
            .ok_or_else(|| Fault::host("attachment path has no parent"))?;
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".{filename}.{}.tmp", uuid::Uuid::now_v7().simple()));
        let written = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(collection, record_id, filename, size = bytes.len(), "attachment saved");
        Ok(bytes.len())
    }

    /// Read a stored file.
    pub fn read(
        &self,
        collection: &str,
        record_id: &str,
        filename: &str,
    ) -> Result<Vec<u8>, Fault> {
        let path = self.path_of(collection, record_id, filename)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Fault::host(format!(
                "file {collection}/{record_id}/{filename} not found"
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
