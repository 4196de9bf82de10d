//! RocksDB-backed project store.
//!
//! Column families:
//! - `projects`: Project records (bincode), keyed by project id
//! - `files`: File metadata (bincode), keyed by file id
//! - `contents`: File content (LZ4 compressed), keyed by file id
//! - `project_files`: Index `<project:8><file:8>` → empty
//! - `members`: Index `<project:8><user:16>` → empty
//! - `users`: User records (bincode), keyed by user UUID
//! - `messages`: Chat `<project:8><message:8>` → message record
//! - `meta`: Id counters
//!
//! All integer key parts are big-endian so prefix scans come back in id order.
//! Structural writes (id allocation, cascades, content overwrites) go through
//! a single writer lock and one `WriteBatch` each, so a content overwrite can
//! never resurrect a file that a concurrent delete just removed.

use codecollab_core::{
    default_file_content, language_for_filename, now_millis, welcome_file, File, FileId, Message,
    MessageId, Project, ProjectDetail, ProjectId, User, UserId, DEFAULT_FILENAME,
};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::Persistence;

const CF_PROJECTS: &str = "projects";
const CF_FILES: &str = "files";
const CF_CONTENTS: &str = "contents";
const CF_PROJECT_FILES: &str = "project_files";
const CF_MEMBERS: &str = "members";
const CF_USERS: &str = "users";
const CF_MESSAGES: &str = "messages";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[
    CF_PROJECTS,
    CF_FILES,
    CF_CONTENTS,
    CF_PROJECT_FILES,
    CF_MEMBERS,
    CF_USERS,
    CF_MESSAGES,
    CF_META,
];

const SEQ_PROJECT: &[u8] = b"seq:project";
const SEQ_FILE: &[u8] = b"seq:file";
const SEQ_MESSAGE: &[u8] = b"seq:message";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codecollab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),
    #[error("File not found: {0}")]
    FileNotFound(FileId),
    #[error("User not found: {0}")]
    UserNotFound(UserId),
    #[error("File {file_id} does not belong to project {project_id}")]
    FileNotInProject { project_id: ProjectId, file_id: FileId },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// File metadata; the content lives in its own column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    id: FileId,
    project_id: ProjectId,
    filename: String,
    language: String,
}

impl FileRecord {
    fn with_content(self, content: String) -> File {
        File {
            id: self.id,
            project_id: self.project_id,
            filename: self.filename,
            language: self.language,
            content,
        }
    }
}

/// RocksDB-backed store for projects, files, memberships, users and chat.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes structural writes
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened project store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PROJECTS | CF_FILES | CF_USERS | CF_META => {
                // Small records, point lookups
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)) as u64);
            }
            CF_CONTENTS => {
                // Already LZ4 compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_PROJECT_FILES | CF_MEMBERS | CF_MESSAGES => {
                // Prefix scanned by project id
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(8));
            }
            _ => {}
        }

        opts
    }

    // ─── Users ────────────────────────────────────────────────────────

    /// Insert or replace a user record.
    pub fn put_user(&self, user: &User) -> Result<(), StoreError> {
        let cf = self.cf(CF_USERS)?;
        self.db
            .put_cf_opt(&cf, user.id.0.as_bytes(), encode(user)?, &self.write_opts())?;
        Ok(())
    }

    fn load_user(&self, user_id: UserId) -> Result<User, StoreError> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_cf(&cf, user_id.0.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::UserNotFound(user_id)),
        }
    }

    // ─── Projects ─────────────────────────────────────────────────────

    /// Create a project owned by `owner_id`, seeded with `index.js`.
    pub fn create_project(&self, owner_id: UserId, name: &str) -> Result<ProjectDetail, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("project name is empty".to_string()));
        }
        let owner = self.load_user(owner_id)?;

        let _guard = self.lock_writes()?;
        let mut batch = WriteBatch::default();

        let project = Project {
            id: ProjectId(self.next_id(&mut batch, SEQ_PROJECT)?),
            name: name.to_string(),
            owner_id,
            created_at: now_millis(),
        };
        batch.put_cf(&self.cf(CF_PROJECTS)?, id_key(project.id.0), encode(&project)?);

        let file = self.stage_file(
            &mut batch,
            project.id,
            DEFAULT_FILENAME,
            welcome_file(&project.name),
        )?;

        self.db.write_opt(batch, &self.write_opts())?;
        log::info!("Created project {} ({}) for {}", project.id, project.name, owner.name);

        Ok(ProjectDetail {
            project,
            files: vec![file],
            members: vec![owner],
        })
    }

    /// Load a project record.
    pub fn project(&self, project_id: ProjectId) -> Result<Project, StoreError> {
        let cf = self.cf(CF_PROJECTS)?;
        match self.db.get_cf(&cf, id_key(project_id.0))? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::ProjectNotFound(project_id)),
        }
    }

    /// Projects owned by a user, newest first.
    pub fn projects_owned_by(&self, owner_id: UserId) -> Result<Vec<Project>, StoreError> {
        let cf = self.cf(CF_PROJECTS)?;
        let mut projects = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let project: Project = decode(&value)?;
            if project.owner_id == owner_id {
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(projects)
    }

    /// A project with its files and members (owner first).
    pub fn project_detail(&self, project_id: ProjectId) -> Result<ProjectDetail, StoreError> {
        let project = self.project(project_id)?;
        let files = self.files(project_id)?;

        let mut members = vec![self.load_user(project.owner_id)?];
        for user_id in self.member_ids(project_id)? {
            if user_id == project.owner_id {
                continue;
            }
            match self.load_user(user_id) {
                Ok(user) => members.push(user),
                Err(e) => log::warn!("Skipping member {user_id} of project {project_id}: {e}"),
            }
        }

        Ok(ProjectDetail {
            project,
            files,
            members,
        })
    }

    /// Delete a project with its files, memberships and chat history.
    pub fn delete_project(&self, project_id: ProjectId) -> Result<(), StoreError> {
        let _guard = self.lock_writes()?;
        self.project(project_id)?;

        let cf_project_files = self.cf(CF_PROJECT_FILES)?;
        let cf_files = self.cf(CF_FILES)?;
        let cf_contents = self.cf(CF_CONTENTS)?;
        let cf_members = self.cf(CF_MEMBERS)?;
        let cf_messages = self.cf(CF_MESSAGES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_PROJECTS)?, id_key(project_id.0));

        let mut removed_files = 0usize;
        for key in self.prefix_keys(CF_PROJECT_FILES, project_id)? {
            let file_key = &key[8..16];
            batch.delete_cf(&cf_files, file_key);
            batch.delete_cf(&cf_contents, file_key);
            batch.delete_cf(&cf_project_files, &key);
            removed_files += 1;
        }
        for key in self.prefix_keys(CF_MEMBERS, project_id)? {
            batch.delete_cf(&cf_members, &key);
        }
        for key in self.prefix_keys(CF_MESSAGES, project_id)? {
            batch.delete_cf(&cf_messages, &key);
        }

        self.db.write_opt(batch, &self.write_opts())?;
        log::info!("Deleted project {project_id} ({removed_files} files)");
        Ok(())
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Grant `user_id` access to `project_id`.
    pub fn add_member(&self, project_id: ProjectId, user_id: UserId) -> Result<(), StoreError> {
        self.project(project_id)?;
        self.load_user(user_id)?;
        let cf = self.cf(CF_MEMBERS)?;
        self.db
            .put_cf_opt(&cf, member_key(project_id, user_id), b"", &self.write_opts())?;
        Ok(())
    }

    fn member_ids(&self, project_id: ProjectId) -> Result<Vec<UserId>, StoreError> {
        let mut ids = Vec::new();
        for key in self.prefix_keys(CF_MEMBERS, project_id)? {
            let uuid = uuid::Uuid::from_slice(&key[8..])
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(UserId(uuid));
        }
        Ok(ids)
    }

    // ─── Files ────────────────────────────────────────────────────────

    /// Create a file; its language is derived from the filename.
    pub fn create_file(&self, project_id: ProjectId, filename: &str) -> Result<File, StoreError> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(StoreError::InvalidInput("filename is empty".to_string()));
        }

        let _guard = self.lock_writes()?;
        self.project(project_id)?;

        let mut batch = WriteBatch::default();
        let file = self.stage_file(&mut batch, project_id, filename, default_file_content(filename))?;
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!("Created file {} ({}) in project {project_id}", file.id, file.filename);
        Ok(file)
    }

    /// Queue the writes for a new file on `batch`.
    fn stage_file(
        &self,
        batch: &mut WriteBatch,
        project_id: ProjectId,
        filename: &str,
        content: String,
    ) -> Result<File, StoreError> {
        let record = FileRecord {
            id: FileId(self.next_id(batch, SEQ_FILE)?),
            project_id,
            filename: filename.to_string(),
            language: language_for_filename(filename).to_string(),
        };
        let key = id_key(record.id.0);
        batch.put_cf(&self.cf(CF_FILES)?, key, encode(&record)?);
        batch.put_cf(&self.cf(CF_CONTENTS)?, key, lz4_flex::compress_prepend_size(content.as_bytes()));
        batch.put_cf(&self.cf(CF_PROJECT_FILES)?, pair_key(project_id, record.id.0), b"");
        Ok(record.with_content(content))
    }

    fn file_record(&self, file_id: FileId) -> Result<FileRecord, StoreError> {
        let cf = self.cf(CF_FILES)?;
        match self.db.get_cf(&cf, id_key(file_id.0))? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::FileNotFound(file_id)),
        }
    }

    fn content(&self, file_id: FileId) -> Result<String, StoreError> {
        let cf = self.cf(CF_CONTENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, id_key(file_id.0))?
            .ok_or(StoreError::FileNotFound(file_id))?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Load a file with its current content.
    pub fn file(&self, file_id: FileId) -> Result<File, StoreError> {
        let record = self.file_record(file_id)?;
        let content = self.content(file_id)?;
        Ok(record.with_content(content))
    }

    /// All files of a project, in creation order.
    pub fn files(&self, project_id: ProjectId) -> Result<Vec<File>, StoreError> {
        self.prefix_keys(CF_PROJECT_FILES, project_id)?
            .iter()
            .map(|key| self.file(FileId(u64_at(key, 8))))
            .collect()
    }

    // ─── Chat ─────────────────────────────────────────────────────────

    /// Chat history of a project, oldest first.
    pub fn messages(&self, project_id: ProjectId) -> Result<Vec<Message>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let prefix = id_key(project_id.0);
        let mut messages = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            messages.push(decode(&value)?);
        }
        Ok(messages)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("writer lock poisoned".to_string()))
    }

    /// Allocate the next id for `seq`, staging the counter update on `batch`.
    ///
    /// Callers must hold the writer lock.
    fn next_id(&self, batch: &mut WriteBatch, seq: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        let last = match self.db.get_cf(&cf, seq)? {
            Some(bytes) if bytes.len() == 8 => u64_at(&bytes, 0),
            Some(_) => return Err(StoreError::Deserialization("corrupt id counter".to_string())),
            None => 0,
        };
        let next = last + 1;
        batch.put_cf(&cf, seq, next.to_be_bytes());
        Ok(next)
    }

    /// All keys in `cf_name` under a project prefix.
    fn prefix_keys(&self, cf_name: &str, project_id: ProjectId) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = id_key(project_id.0);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl Persistence for RocksStore {
    fn overwrite_content(
        &self,
        project_id: ProjectId,
        file_id: FileId,
        content: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.lock_writes()?;
        let record = self.file_record(file_id)?;
        if record.project_id != project_id {
            return Err(StoreError::FileNotInProject { project_id, file_id });
        }

        let cf = self.cf(CF_CONTENTS)?;
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        self.db
            .put_cf_opt(&cf, id_key(file_id.0), compressed, &self.write_opts())?;
        Ok(())
    }

    fn append_message(
        &self,
        project_id: ProjectId,
        author_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        if content.is_empty() {
            return Err(StoreError::InvalidInput("message content is empty".to_string()));
        }
        self.load_user(author_id)?;

        let _guard = self.lock_writes()?;
        self.project(project_id)?;

        let mut batch = WriteBatch::default();
        let message = Message {
            id: MessageId(self.next_id(&mut batch, SEQ_MESSAGE)?),
            project_id,
            author_id,
            content: content.to_string(),
            created_at: now_millis(),
        };
        batch.put_cf(
            &self.cf(CF_MESSAGES)?,
            pair_key(project_id, message.id.0),
            encode(&message)?,
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(message)
    }

    fn user(&self, user_id: UserId) -> Result<User, StoreError> {
        self.load_user(user_id)
    }

    fn is_member(&self, project_id: ProjectId, user_id: UserId) -> Result<bool, StoreError> {
        let project = match self.project(project_id) {
            Ok(p) => p,
            Err(StoreError::ProjectNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if project.owner_id == user_id {
            return Ok(true);
        }
        let cf = self.cf(CF_MEMBERS)?;
        Ok(self.db.get_cf(&cf, member_key(project_id, user_id))?.is_some())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// `<project:8><id:8>`
fn pair_key(project_id: ProjectId, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&project_id.0.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// `<project:8><user:16>`
fn member_key(project_id: ProjectId, user_id: UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&project_id.0.to_be_bytes());
    key.extend_from_slice(user_id.0.as_bytes());
    key
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(buf)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
