//! Configuration for migrations and range deletion.

use std::time::Duration;

/// Configuration for the migration machinery on one shard.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Maximum documents per clone batch.
    pub clone_batch_size: usize,
    /// Maximum bytes per clone batch.
    pub max_clone_batch_bytes: usize,
    /// Maximum ops drained per catch-up round.
    pub mods_batch_size: usize,
    /// Maximum catch-up rounds before giving up.
    pub max_catchup_rounds: u32,
    /// Wall-clock budget for the catch-up phase.
    pub catchup_timeout: Duration,
    /// How long the donor waits for the recipient's commit ack.
    pub critical_section_timeout: Duration,
    /// How long a recipient session may sit idle before it is treated
    /// as abandoned by its donor and aborted.
    pub recipient_session_timeout: Duration,
    /// Maximum concurrent migrations on this shard.
    pub max_concurrent: usize,
    /// Whether `move_range` waits for the donor's orphaned range to be
    /// physically deleted before returning.
    pub wait_for_delete: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 500,
            max_clone_batch_bytes: 2 * 1024 * 1024,
            mods_batch_size: 256,
            max_catchup_rounds: 16,
            catchup_timeout: Duration::from_secs(30),
            critical_section_timeout: Duration::from_secs(5),
            recipient_session_timeout: Duration::from_secs(120),
            max_concurrent: 4,
            wait_for_delete: false,
        }
    }
}

impl MigrationConfig {
    /// Set the clone batch size.
    pub fn with_clone_batch_size(mut self, size: usize) -> Self {
        self.clone_batch_size = size;
        self
    }

    /// Set the catch-up round budget.
    pub fn with_max_catchup_rounds(mut self, rounds: u32) -> Self {
        self.max_catchup_rounds = rounds;
        self
    }

    /// Set the catch-up wall-clock budget.
    pub fn with_catchup_timeout(mut self, timeout: Duration) -> Self {
        self.catchup_timeout = timeout;
        self
    }

    /// Set the critical section ack timeout.
    pub fn with_critical_section_timeout(mut self, timeout: Duration) -> Self {
        self.critical_section_timeout = timeout;
        self
    }

    /// Set the recipient session idle deadline.
    pub fn with_recipient_session_timeout(mut self, timeout: Duration) -> Self {
        self.recipient_session_timeout = timeout;
        self
    }

    /// Set the concurrent migration limit.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Wait for range deletion before `move_range` returns.
    pub fn with_wait_for_delete(mut self, wait: bool) -> Self {
        self.wait_for_delete = wait;
        self
    }
}

/// Configuration for the range deletion scheduler.
#[derive(Debug, Clone)]
pub struct RangeDeletionConfig {
    /// Maximum documents deleted per storage batch.
    pub delete_batch_size: usize,
    /// Retries for transient storage errors per task.
    pub max_retries: u32,
    /// Delay between retries.
    pub retry_delay: Duration,
}

impl Default for RangeDeletionConfig {
    fn default() -> Self {
        Self {
            delete_batch_size: 128,
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl RangeDeletionConfig {
    /// Set the delete batch size.
    pub fn with_delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}
