use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use herald_common::{Message, MessageId, internal};
use serde::Deserialize;
use tokio::fs;

use crate::{
    SerializationError, StoreError, ValidationError, r#trait::MessageStore,
};

const SENSITIVE_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// File-based message store
///
/// Each message is kept as `{id}.bin` in the store directory, encoded with
/// bincode. The ID is a ULID, so a directory listing sorted by name is also
/// sorted by creation time.
///
/// # Atomicity
/// Every write goes to `.tmp_{id}.bin` first and is then renamed over the
/// final name. A crash mid-write leaves at worst a temporary file, which
/// [`FileMessageStore::init`] removes and [`MessageStore::list`] ignores.
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    path: PathBuf,
}

impl Default for FileMessageStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/herald/messages"),
        }
    }
}

impl<'de> Deserialize<'de> for FileMessageStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileMessageStoreHelper {
            path: PathBuf,
        }

        let helper = FileMessageStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { path: helper.path })
    }
}

impl FileMessageStore {
    /// Reject paths that traverse upwards, are relative, or point into a
    /// system directory.
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDirectory(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        if let Some(prefix) = SENSITIVE_PREFIXES
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileMessageStoreBuilder {
        FileMessageStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the store directory if needed and remove temporary files left
    /// behind by a crash.
    ///
    /// # Errors
    /// - If the directory cannot be created or read
    /// - If the path exists but is not a directory
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising message store at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(".tmp_") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned temporary files from message store"
            );
        }

        Ok(())
    }

    fn message_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(id.filename())
    }

    async fn persist(&self, message: &Message) -> crate::Result<()> {
        let filename = message.id.filename();
        let temp_path = self.path.join(format!(".tmp_{filename}"));

        let encoded = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(SerializationError::from)?;

        fs::write(&temp_path, &encoded).await?;
        fs::rename(&temp_path, self.path.join(&filename)).await?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, message), fields(message_id = %message.id))]
    async fn write(&self, message: &Message) -> crate::Result<()> {
        if fs::try_exists(self.message_path(&message.id)).await? {
            return Err(StoreError::AlreadyExists(message.id));
        }

        self.persist(message).await?;
        internal!(level = DEBUG, "Stored message {}", message.id);

        Ok(())
    }

    /// Only `{ulid}.bin` names are considered; temporary files and anything
    /// that is not a valid ULID are skipped.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    async fn list(&self) -> crate::Result<Vec<MessageId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            if let Some(id) = MessageId::from_filename(&filename.to_string_lossy()) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self), fields(message_id = %id))]
    async fn read(&self, id: &MessageId) -> crate::Result<Message> {
        let bytes = match fs::read(self.message_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*id));
            }
            Err(e) => return Err(e.into()),
        };

        let (message, _): (Message, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(SerializationError::from)?;

        if message.id != *id {
            return Err(SerializationError::Corrupted(format!(
                "{} holds message {}",
                id.filename(),
                message.id
            ))
            .into());
        }

        Ok(message)
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, message), fields(message_id = %message.id))]
    async fn update(&self, message: &Message) -> crate::Result<()> {
        if !fs::try_exists(self.message_path(&message.id)).await? {
            return Err(StoreError::NotFound(message.id));
        }

        self.persist(message).await
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self), fields(message_id = %id))]
    async fn delete(&self, id: &MessageId) -> crate::Result<()> {
        match fs::remove_file(self.message_path(id)).await {
            Ok(()) => {
                internal!(level = DEBUG, "Deleted message {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builder for [`FileMessageStore`] that validates the path on `build()`
#[derive(Debug, Default)]
pub struct FileMessageStoreBuilder {
    path: Option<PathBuf>,
}

impl FileMessageStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// # Errors
    /// Returns an error if no path was given or the path fails validation
    pub fn build(self) -> crate::Result<FileMessageStore> {
        let path = self.path.ok_or_else(|| {
            ValidationError::InvalidConfiguration("a store path is required".to_string())
        })?;

        FileMessageStore::validate_path(&path)?;
        Ok(FileMessageStore { path })
    }
}
