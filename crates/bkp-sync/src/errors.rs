use bkp_monalisa::MonAlisaError;
use bkp_storage::StoreError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] MonAlisaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("`{0}` does not name a pass of an LHC period")]
    InvalidPassName(String),
    #[error("There is no data passes in DB which are associated to {0}")]
    NoAssociatedDataPasses(String),
}

/// Per-item failures of one batch grouped by message, in first-seen order.
#[derive(Debug, Default)]
pub struct ErrorAggregate {
    groups: Vec<(String, Vec<String>)>,
}

impl ErrorAggregate {
    pub fn record(&mut self, name: &str, error: &SyncError) {
        let message = error.to_string();
        match self.groups.iter_mut().find(|(m, _)| *m == message) {
            Some((_, names)) => names.push(name.to_string()),
            None => self.groups.push((message, vec![name.to_string()])),
        }
    }

    pub fn failed(&self) -> usize {
        self.groups.iter().map(|(_, names)| names.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[(String, Vec<String>)] {
        &self.groups
    }

    /// Emits one error line per distinct message.
    pub fn log(&self, resource: &str) {
        for (message, names) in &self.groups {
            error!(
                resource,
                affected = names.len(),
                "Error for {resource} ({}):\n{message}",
                names.join(",")
            );
        }
    }
}
