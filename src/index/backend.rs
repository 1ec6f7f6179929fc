//! # Mailbox Backend Contract
//!
//! The index engine knows nothing about mailbox formats. Everything that
//! requires reading actual mail lives behind this trait, supplied by the
//! mailbox implementation at construction time.

use eyre::Result;

use super::IndexState;

/// Format-specific hooks the index invokes while opening, locking and
/// recovering. Implementations receive the bare storage state and may call
/// any of its operations, including lock transitions.
pub trait MailboxBackend {
    /// Rebuilds the index from the mailbox: reset the record array
    /// ([`IndexState::rebuild_reset`]), append a record per mail, then clear
    /// the rebuild request ([`IndexState::rebuild_complete`]).
    fn rebuild(&mut self, index: &mut IndexState) -> Result<()>;

    /// Reconciles the index with mailbox changes made since the last lock.
    /// Invoked before every unlocked-to-locked transition and during open.
    fn sync(&mut self, index: &mut IndexState) -> Result<()>;

    /// Best-effort repair after an unclean shutdown. Most implementations
    /// recount the header from the records ([`IndexState::fsck_recount`])
    /// and verify mails still exist.
    fn fsck(&mut self, index: &mut IndexState) -> Result<()>;

    /// Materializes newly requested cache fields on existing records: walk
    /// the live records and rewrite the ones whose `cached_fields` lack bits
    /// of `header.cache_fields`, via [`IndexState::update_record_fields`].
    /// Unlike `rebuild` this must leave `indexid`, UID assignment and the
    /// record array untouched. The default does nothing, which is correct
    /// for backends that never cache beyond what appends already store.
    fn update_cache(&mut self, _index: &mut IndexState) -> Result<()> {
        Ok(())
    }
}
