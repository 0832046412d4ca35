use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::error::{TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};

use super::step_log::{StepChange, StepLogError};
use super::step_store::StepStore;
use crate::metrics::track_db_operation;
use crate::models::{Attempt, Step};
use crate::utils::retry::{retry_async_when, RetryConfig};

const ATTEMPTS_COLLECTION: &str = "question_attempts";
const STEPS_COLLECTION: &str = "question_attempt_steps";
const MAX_COMMIT_RETRIES: u32 = 3;

/// MongoDB-backed step store. Writes run in multi-document transactions, so
/// the server must be a replica set (a single-node one is enough).
pub struct MongoStepStore {
    client: Client,
    mongo: Database,
}

impl MongoStepStore {
    pub fn new(client: Client, database: &str) -> Self {
        let mongo = client.database(database);
        Self { client, mongo }
    }

    fn attempts(&self) -> Collection<Attempt> {
        self.mongo.collection(ATTEMPTS_COLLECTION)
    }

    fn steps(&self) -> Collection<Step> {
        self.mongo.collection(STEPS_COLLECTION)
    }

    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        let sequence_index = IndexModel::builder()
            .keys(doc! { "attempt_id": 1, "sequence_number": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.steps()
            .create_index(sequence_index)
            .await
            .context("Failed to create step sequence index")?;

        tracing::info!("MongoDB indexes ensured for step store");
        Ok(())
    }

    async fn start_transaction(&self) -> Result<ClientSession, StepLogError> {
        let mut session = self
            .client
            .start_session()
            .await
            .context("Failed to start MongoDB session")?;
        session
            .start_transaction()
            .await
            .context("Failed to start MongoDB transaction")?;
        Ok(session)
    }

    async fn finish_transaction(
        session: &mut ClientSession,
        result: Result<(), StepLogError>,
    ) -> Result<(), StepLogError> {
        match result {
            Ok(()) => Self::commit_with_retry(session).await,
            Err(e) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!("Failed to abort step transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Re-issues only the commit when its outcome is unknown; the write may
    /// already be applied, so the transaction body must not run again.
    async fn commit_with_retry(session: &mut ClientSession) -> Result<(), StepLogError> {
        let mut retries = 0;
        loop {
            match session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if retries < MAX_COMMIT_RETRIES
                        && e.labels().iter().any(|label| retries_commit(label)) =>
                {
                    retries += 1;
                    tracing::warn!(
                        "Step transaction commit result unknown, retrying commit ({}/{}): {}",
                        retries,
                        MAX_COMMIT_RETRIES,
                        e
                    );
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context("Failed to commit step transaction")
                        .into())
                }
            }
        }
    }

    async fn create_attempt_once(
        &self,
        attempt: &Attempt,
        initial_step: &Step,
    ) -> Result<(), StepLogError> {
        let mut session = self.start_transaction().await?;

        let result: Result<(), StepLogError> = async {
            self.attempts()
                .insert_one(attempt)
                .session(&mut session)
                .await
                .context("Failed to insert attempt")?;
            self.steps()
                .insert_one(initial_step)
                .session(&mut session)
                .await
                .context("Failed to insert initial step")?;
            Ok(())
        }
        .await;

        Self::finish_transaction(&mut session, result).await
    }

    async fn commit_once(
        &self,
        attempt_id: &str,
        expected_tail: &str,
        change: &StepChange,
    ) -> Result<(), StepLogError> {
        let mut session = self.start_transaction().await?;
        let result = self
            .apply_change(&mut session, attempt_id, expected_tail, change)
            .await;
        Self::finish_transaction(&mut session, result).await
    }

    async fn apply_change(
        &self,
        session: &mut ClientSession,
        attempt_id: &str,
        expected_tail: &str,
        change: &StepChange,
    ) -> Result<(), StepLogError> {
        // Reading the tail inside the transaction makes a concurrent writer
        // fail with a write conflict instead of interleaving.
        let tail = self
            .steps()
            .find_one(doc! { "attempt_id": attempt_id })
            .sort(doc! { "sequence_number": -1 })
            .session(&mut *session)
            .await
            .context("Failed to read tail step")?
            .ok_or_else(|| StepLogError::NotFound(attempt_id.to_string()))?;

        if tail.id != expected_tail {
            return Err(StepLogError::Conflict {
                expected: expected_tail.to_string(),
                actual: tail.id,
            });
        }

        if let Some(removed) = &change.removed {
            let deleted = self
                .steps()
                .delete_one(doc! { "_id": removed.as_str(), "attempt_id": attempt_id })
                .session(&mut *session)
                .await
                .context("Failed to delete autosave step")?;
            if deleted.deleted_count != 1 {
                return Err(StepLogError::Conflict {
                    expected: removed.clone(),
                    actual: tail.id,
                });
            }
        }

        if let Some(step) = &change.appended {
            self.steps()
                .insert_one(step)
                .session(&mut *session)
                .await
                .context("Failed to insert step")?;
        }

        Ok(())
    }
}

/// Labels that call for running the whole transaction again.
fn restarts_transaction(label: &str) -> bool {
    label == TRANSIENT_TRANSACTION_ERROR
}

/// Labels that call for re-sending only `commitTransaction`.
fn retries_commit(label: &str) -> bool {
    label == UNKNOWN_TRANSACTION_COMMIT_RESULT
}

fn is_transient(err: &StepLogError) -> bool {
    let StepLogError::Storage(err) = err else {
        return false;
    };

    err.chain()
        .filter_map(|cause| cause.downcast_ref::<mongodb::error::Error>())
        .any(|e| e.labels().iter().any(|label| restarts_transaction(label)))
}

#[async_trait]
impl StepStore for MongoStepStore {
    async fn create_attempt(
        &self,
        attempt: &Attempt,
        initial_step: &Step,
    ) -> Result<(), StepLogError> {
        track_db_operation(
            "create_attempt",
            ATTEMPTS_COLLECTION,
            retry_async_when(RetryConfig::transaction(), is_transient, || {
                self.create_attempt_once(attempt, initial_step)
            }),
        )
        .await
    }

    async fn find_attempt(&self, attempt_id: &str) -> Result<Option<Attempt>, StepLogError> {
        track_db_operation("find_one", ATTEMPTS_COLLECTION, async {
            let attempt = self
                .attempts()
                .find_one(doc! { "_id": attempt_id })
                .await
                .context("Failed to query attempt")?;
            Ok::<_, StepLogError>(attempt)
        })
        .await
    }

    async fn load_steps(&self, attempt_id: &str) -> Result<Vec<Step>, StepLogError> {
        track_db_operation("find", STEPS_COLLECTION, async {
            let mut cursor = self
                .steps()
                .find(doc! { "attempt_id": attempt_id })
                .sort(doc! { "sequence_number": 1 })
                .await
                .context("Failed to query steps")?;

            let mut steps = Vec::new();
            while let Some(step) = cursor
                .try_next()
                .await
                .context("Step cursor error")?
            {
                steps.push(step);
            }
            Ok::<_, StepLogError>(steps)
        })
        .await
    }

    async fn commit(
        &self,
        attempt_id: &str,
        expected_tail: &str,
        change: &StepChange,
    ) -> Result<(), StepLogError> {
        if change.is_noop() {
            return Ok(());
        }

        track_db_operation(
            "commit",
            STEPS_COLLECTION,
            retry_async_when(RetryConfig::transaction(), is_transient, || {
                self.commit_once(attempt_id, expected_tail, change)
            }),
        )
        .await
    }

    async fn ping(&self) -> Result<(), StepLogError> {
        self.mongo
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "mongodb"
    }
}
