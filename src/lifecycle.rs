//! Provisioner lifecycle controller.
//!
//! One run walks a fixed sequence of stages:
//!
//! ```text
//! Start -> CheckExisting -> [DeleteExisting] -> Add -> Wait -> DeleteFinal -> Done
//! ```
//!
//! Any failure ends the run with a [`LifecycleError`] naming the stage. The
//! provisioner is only ever added when no entry of the same name is listed,
//! and the final delete runs however the wait ended. An interrupt before the
//! wait abandons the stage in flight and ends the run without a final delete.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, LifecycleError, LifecycleResult, ToolResult};
use crate::provisioner::{listing_contains, AdminCredential, KeyMaterial, ProvisionerName};
use crate::runner::{AddJwk, CommandRunner};
use crate::secret::DecryptedKey;
use crate::wait::{wait_for_cancellation_or_timeout, CancelSource, WaitOutcome};

/// Stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    CheckExisting,
    DeleteExisting,
    Add,
    Wait,
    DeleteFinal,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::CheckExisting => "check existing provisioner",
            Self::DeleteExisting => "delete existing provisioner",
            Self::Add => "add provisioner",
            Self::Wait => "wait for operator",
            Self::DeleteFinal => "delete provisioner",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// What a run works on.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: ProvisionerName,
    pub admin: AdminCredential,
    pub keys: KeyMaterial,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Where the plaintext key is staged; system temp when `None`
    pub scratch_dir: Option<PathBuf>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// A provisioner with the same name was found and deleted first.
    pub replaced_existing: bool,
    pub outcome: WaitOutcome,
    pub waited: Duration,
}

pub struct Lifecycle<R> {
    runner: R,
    plan: Plan,
}

impl<R: CommandRunner> Lifecycle<R> {
    pub fn new(runner: R, plan: Plan) -> Self {
        Self { runner, plan }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Whether the CA currently lists the provisioner.
    pub async fn provisioner_exists(&self) -> LifecycleResult<bool> {
        let listing = self
            .runner
            .list()
            .await
            .map_err(|source| LifecycleError::Query {
                name: self.plan.name.to_string(),
                source,
            })?;
        Ok(listing_contains(&listing, &self.plan.name))
    }

    /// Remove the provisioner. Callers map the failure to the stage they are in.
    pub async fn delete_provisioner(&self) -> ToolResult<()> {
        self.runner.remove(&self.plan.name, &self.plan.admin).await
    }

    /// Decrypt the private key into a scoped temporary file.
    pub async fn decrypt_private_key(&self) -> LifecycleResult<DecryptedKey> {
        let encrypted = &self.plan.keys.private_key;
        DecryptedKey::decrypt(&self.runner, encrypted, self.plan.scratch_dir.as_deref())
            .await
            .map_err(|source| LifecycleError::Decrypt {
                path: encrypted.clone(),
                source,
            })
    }

    /// Decrypt the private key and register the JWK provisioner with it.
    ///
    /// The plaintext key is gone by the time this returns, whatever the outcome.
    pub async fn add_provisioner(&self) -> LifecycleResult<()> {
        let key = self.decrypt_private_key().await?;

        let result = self
            .runner
            .add(AddJwk {
                name: &self.plan.name,
                public_key: &self.plan.keys.public_key,
                private_key: key.path(),
                admin: &self.plan.admin,
            })
            .await;

        let staged = key.path().to_path_buf();
        if let Err(e) = key.destroy() {
            error!(path = %staged.display(), "Failed to remove decrypted private key: {}", e);
        }

        result.map_err(|source| LifecycleError::Add {
            name: self.plan.name.to_string(),
            source,
        })
    }

    /// Wait for the operator or the timeout.
    pub async fn wait<S>(&self, input: &mut S) -> WaitOutcome
    where
        S: CancelSource + ?Sized,
    {
        wait_for_cancellation_or_timeout(input, self.plan.timeout, self.plan.poll_interval).await
    }

    /// Run the whole lifecycle once.
    pub async fn run<S>(&self, input: &mut S) -> LifecycleResult<RunReport>
    where
        S: CancelSource + ?Sized,
    {
        let name = &self.plan.name;

        enter(Stage::Start);
        if !self.plan.keys.public_key_present() {
            return Err(ConfigError::MissingPublicKey(self.plan.keys.public_key.clone()).into());
        }

        enter(Stage::CheckExisting);
        let replaced_existing =
            interruptible(&mut *input, Stage::CheckExisting, self.provisioner_exists()).await?;

        if replaced_existing {
            enter(Stage::DeleteExisting);
            println!("Provisioner {name} already exists. Deleting existing provisioner...");
            let delete = async {
                self.delete_provisioner()
                    .await
                    .map_err(|source| LifecycleError::Delete {
                        name: name.to_string(),
                        source,
                    })
            };
            interruptible(&mut *input, Stage::DeleteExisting, delete).await?;
            println!("Existing provisioner {name} deleted.");
        }

        enter(Stage::Add);
        interruptible(&mut *input, Stage::Add, self.add_provisioner()).await?;
        info!(provisioner = %name, "Provisioner added");
        println!("Provisioner {name} added.");

        enter(Stage::Wait);
        println!(
            "Press any key to delete it (up to {} seconds)",
            self.plan.timeout.as_secs()
        );
        let started = Instant::now();
        let outcome = self.wait(input).await;
        let waited = started.elapsed();

        enter(Stage::DeleteFinal);
        self.delete_provisioner()
            .await
            .map_err(|source| LifecycleError::Revoke {
                name: name.to_string(),
                source,
            })?;
        info!(provisioner = %name, ?outcome, ?waited, "Provisioner revoked");
        println!("Provisioner {name} deleted.");

        enter(Stage::Done);
        Ok(RunReport {
            replaced_existing,
            outcome,
            waited,
        })
    }
}

fn enter(stage: Stage) {
    debug!(%stage, "Entering stage");
}

/// Run `work` unless the operator interrupts first.
///
/// On interrupt `work` is dropped: running tools are killed and a staged
/// plaintext key is wiped with it.
async fn interruptible<S, F, T>(input: &mut S, stage: Stage, work: F) -> LifecycleResult<T>
where
    S: CancelSource + ?Sized,
    F: Future<Output = LifecycleResult<T>>,
{
    tokio::select! {
        result = work => result,
        _ = input.interrupted() => {
            warn!(%stage, "Interrupted, abandoning the run");
            Err(LifecycleError::Interrupted { stage })
        }
    }
}
