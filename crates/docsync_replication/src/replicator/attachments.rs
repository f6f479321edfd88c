//! Attachment reconciliation for settled documents.
//!
//! Attachments run through the same decision table as documents, with their
//! own change checks, against per-name hashes kept in the owning document's
//! signature. The record is written once per document, after every name was
//! handled.

use super::{Replicator, TaskError, TaskResult};
use crate::report::{FailedId, FailureReason, LogKind, PassMode, ReportEntry};
use crate::resolver::{decide, Decision, Side};
use crate::signature::SignatureRecord;
use docsync_store::{AttachmentMeta, Blob};
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Default)]
pub(super) struct AttachmentOutcome {
    pub(super) entries: Vec<ReportEntry>,
    pub(super) failures: Vec<FailedId>,
    pub(super) abandoned: bool,
}

impl AttachmentOutcome {
    fn log(&mut self, id: &str, name: &str, kind: LogKind) {
        self.entries.push(ReportEntry {
            id: id.to_string(),
            attachment: Some(name.to_string()),
            kind,
        });
    }

    fn fail(&mut self, id: &str, name: Option<&str>, reason: FailureReason) {
        self.failures.push(FailedId {
            id: id.to_string(),
            attachment: name.map(str::to_string),
            reason,
        });
    }
}

impl Replicator {
    pub(super) async fn reconcile_attachments(&self, id: String, mode: PassMode) -> AttachmentOutcome {
        let mut outcome = AttachmentOutcome::default();
        match self.reconcile_attachments_inner(&id, mode, &mut outcome).await {
            Ok(()) => {}
            Err(TaskError::Cancelled) => {
                debug!(id = %id, "attachment task abandoned");
                outcome.abandoned = true;
            }
            Err(TaskError::Store(e)) => {
                warn!(id = %id, error = %e, "attachment listing failed");
                outcome.fail(&id, None, FailureReason::from(&e));
            }
        }
        outcome
    }

    async fn reconcile_attachments_inner(
        &self,
        id: &str,
        mode: PassMode,
        outcome: &mut AttachmentOutcome,
    ) -> TaskResult<()> {
        self.check_cancelled()?;
        let mut record = self
            .signatures
            .load(id)
            .await?
            .unwrap_or_else(|| SignatureRecord::new(id));
        let (local, remote) = futures::try_join!(
            self.list_attachments(Side::Local, id),
            self.list_attachments(Side::Remote, id),
        )?;

        let names: BTreeSet<String> = local
            .keys()
            .chain(remote.keys())
            .cloned()
            .chain(record.attachment_names())
            .collect();

        let mut dirty = false;
        for name in &names {
            self.check_cancelled()?;
            let result = self
                .reconcile_attachment(
                    id,
                    name,
                    local.get(name),
                    remote.get(name),
                    &mut record,
                    mode,
                    outcome,
                )
                .await;
            match result {
                Ok(changed) => dirty |= changed,
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(TaskError::Store(e)) => {
                    warn!(id, attachment = %name, error = %e, "attachment replication failed");
                    outcome.fail(id, Some(name), FailureReason::from(&e));
                }
            }
        }

        if dirty && mode == PassMode::Repair {
            self.check_cancelled()?;
            self.signatures.save(&record).await?;
        }
        Ok(())
    }

    /// Handles one attachment name. Returns true if the record changed.
    #[allow(clippy::too_many_arguments)]
    async fn reconcile_attachment(
        &self,
        id: &str,
        name: &str,
        local_meta: Option<&AttachmentMeta>,
        remote_meta: Option<&AttachmentMeta>,
        record: &mut SignatureRecord,
        mode: PassMode,
        outcome: &mut AttachmentOutcome,
    ) -> TaskResult<bool> {
        let mut local_blob = None;
        let mut remote_blob = None;
        let local_hash = match local_meta {
            Some(meta) => Some(
                self.attachment_hash(Side::Local, id, name, meta, &mut local_blob)
                    .await?,
            ),
            None => None,
        };
        let remote_hash = match remote_meta {
            Some(meta) => Some(
                self.attachment_hash(Side::Remote, id, name, meta, &mut remote_blob)
                    .await?,
            ),
            None => None,
        };

        let decision = decide(
            local_hash.as_deref(),
            remote_hash.as_deref(),
            record.attachment_baseline(name),
            &self.attachment_policy,
        );
        debug!(id, attachment = name, ?decision, "attachment decision");
        outcome.log(id, name, LogKind::from(&decision));

        if decision == Decision::Conflict {
            outcome.fail(id, Some(name), FailureReason::Conflict);
            return Ok(false);
        }
        if mode == PassMode::Check {
            return Ok(false);
        }

        self.check_cancelled()?;
        match decision {
            Decision::Record => {
                if let Some(hash) = &local_hash {
                    record.set_attachment(name, hash);
                }
                Ok(true)
            }
            Decision::Forget => {
                record.forget_attachment(name);
                Ok(true)
            }
            Decision::Push { .. } => {
                let blob = self.attachment_body(Side::Local, id, name, local_blob).await?;
                self.retrying("put_attachment", || {
                    self.remote.put_attachment(id, name, blob.clone())
                })
                .await?;
                if let Some(hash) = &local_hash {
                    record.set_attachment(name, hash);
                }
                Ok(true)
            }
            Decision::Pull { .. } => {
                let blob = self
                    .attachment_body(Side::Remote, id, name, remote_blob)
                    .await?;
                self.retrying("put_attachment", || {
                    self.local.put_attachment(id, name, blob.clone())
                })
                .await?;
                if let Some(hash) = &remote_hash {
                    record.set_attachment(name, hash);
                }
                Ok(true)
            }
            Decision::DeleteLocal => {
                self.remove_attachment(Side::Local, id, name).await?;
                record.forget_attachment(name);
                Ok(true)
            }
            Decision::DeleteRemote => {
                self.remove_attachment(Side::Remote, id, name).await?;
                record.forget_attachment(name);
                Ok(true)
            }
            Decision::NoOp | Decision::Conflict | Decision::Deferred | Decision::Skip(_) => Ok(false),
        }
    }

    /// Uses the listed digest when the store provides one, otherwise reads
    /// the blob and keeps it for a later transfer.
    async fn attachment_hash(
        &self,
        side: Side,
        id: &str,
        name: &str,
        meta: &AttachmentMeta,
        cache: &mut Option<Blob>,
    ) -> TaskResult<String> {
        if let Some(digest) = &meta.digest {
            return Ok(digest.clone());
        }
        let store = self.store(side);
        let blob = self
            .retrying("get_attachment", || store.get_attachment(id, name))
            .await?;
        let hash = blob.digest();
        *cache = Some(blob);
        Ok(hash)
    }

    async fn attachment_body(
        &self,
        side: Side,
        id: &str,
        name: &str,
        cached: Option<Blob>,
    ) -> TaskResult<Blob> {
        match cached {
            Some(blob) => Ok(blob),
            None => {
                let store = self.store(side);
                Ok(self
                    .retrying("get_attachment", || store.get_attachment(id, name))
                    .await?)
            }
        }
    }

    async fn remove_attachment(&self, side: Side, id: &str, name: &str) -> TaskResult<()> {
        let store = self.store(side);
        match self
            .retrying("remove_attachment", || store.remove_attachment(id, name))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
