//! Validation of CBGT partition index placement in distributed index mode.
//!
//! Writer nodes share the index partitions (pindexes) between themselves. After the writers
//! start, the plan converges asynchronously: first every pindex gets an owner, then the owners
//! even out. A healthy plan has every writer owning a pindex and no two writers' counts
//! differing by more than one.
use std::collections::BTreeMap;
use std::time;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use testkit_common::retry::{with_retry, RetryError, RetryPolicy};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, ValidationError};

/// The subset of `/_cbgt/api/cfg` needed to count pindex owners.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CbgtConfig {
    #[serde(rename = "planPIndexes", default)]
    pub plan_pindexes: Option<PlanPIndexes>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlanPIndexes {
    #[serde(rename = "planPIndexes", default)]
    pub plan_pindexes: BTreeMap<String, PlanPIndex>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlanPIndex {
    #[serde(default)]
    pub nodes: PIndexNodes,
}

/// Owners of a pindex. CBGT keys the owners by node UUID; older dumps list the UUIDs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PIndexNodes {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl Default for PIndexNodes {
    fn default() -> Self {
        PIndexNodes::List(Vec::new())
    }
}

impl PIndexNodes {
    pub fn uuids(&self) -> Vec<String> {
        match self {
            PIndexNodes::List(uuids) => uuids.clone(),
            PIndexNodes::Map(nodes) => nodes.keys().cloned().collect(),
        }
    }
}

/// The CBGT endpoints of one writer node's admin API.
#[async_trait]
pub trait CbgtAdmin: Send + Sync {
    /// Name of the node, for logs and diagnostics.
    fn node_name(&self) -> &str;

    async fn get_cbgt_config(&self) -> Result<CbgtConfig, ApiError>;

    async fn get_cbgt_diagnostics(&self) -> Result<Value, ApiError>;
}

/// Diagnostics captured from one writer after a failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct WriterDiagnostics {
    pub node: String,
    pub diagnostics: Option<Value>,
    pub error: Option<String>,
}

/// Count the pindexes owned by each node UUID.
///
/// A pindex with more than one owner is a fatal error, returned as soon as it is seen. Pindexes
/// without an owner are not counted.
pub fn count_pindexes(config: &CbgtConfig) -> Result<BTreeMap<String, usize>, ValidationError> {
    let mut counts = BTreeMap::new();

    let plan = config
        .plan_pindexes
        .as_ref()
        .map(|plan| &plan.plan_pindexes);

    for (pindex, assignment) in plan.into_iter().flatten() {
        let nodes = assignment.nodes.uuids();

        match nodes.as_slice() {
            [] => debug!(%pindex, "pindex has no owner"),
            [node] => *counts.entry(node.clone()).or_insert(0) += 1,
            _ => {
                return Err(ValidationError::MultipleOwners {
                    pindex: pindex.clone(),
                    nodes,
                })
            }
        }
    }

    Ok(counts)
}

/// Check that exactly `writers` nodes own pindexes and their counts differ by at most one.
pub fn check_balance(
    counts: &BTreeMap<String, usize>,
    writers: usize,
) -> Result<(), ValidationError> {
    if counts.len() != writers {
        return Err(ValidationError::NodeCountMismatch {
            nodes: counts.len(),
            writers,
        });
    }

    let most = counts.iter().max_by_key(|(_, count)| **count);
    let least = counts.iter().min_by_key(|(_, count)| **count);

    if let (Some((node, count)), Some((other, other_count))) = (most, least) {
        if count - other_count > 1 {
            return Err(ValidationError::Imbalanced {
                node: node.clone(),
                count: *count,
                other: other.clone(),
                other_count: *other_count,
            });
        }
    }

    Ok(())
}

/// Checks pindex placement as seen by the writer nodes of a distributed index cluster.
pub struct CbgtDistributionValidator<A> {
    writers: Vec<A>,
    retry_policy: RetryPolicy,
}

impl<A: CbgtAdmin> CbgtDistributionValidator<A> {
    pub fn new(writers: Vec<A>) -> Self {
        Self {
            writers,
            retry_policy: RetryPolicy::fixed(10, time::Duration::from_secs(5)),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn writers(&self) -> &[A] {
        &self.writers
    }

    /// Fetch the plan from one writer and check it, returning the per node counts.
    pub async fn check(&self) -> Result<BTreeMap<String, usize>, ValidationError> {
        let writer = self.writers.first().ok_or(ValidationError::NoWriters)?;

        let config = writer.get_cbgt_config().await?;
        let counts = count_pindexes(&config)?;
        info!(node = writer.node_name(), ?counts, "CBGT node to pindex counts");

        check_balance(&counts, self.writers.len())?;
        Ok(counts)
    }

    /// Whether the plan is balanced right now. Only fatal errors are returned as `Err`.
    pub async fn validate(&self) -> Result<bool, ValidationError> {
        match self.check().await {
            Ok(_) => Ok(true),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                warn!("CBGT pindex distribution is not valid yet: {}", error);
                Ok(false)
            }
        }
    }

    /// Validate until the plan is balanced or the retry policy runs out.
    /// Running out is not an error: it returns `Ok(false)`.
    pub async fn validate_with_retry(&self) -> Result<bool, ValidationError> {
        let outcome = with_retry(&self.retry_policy, move |_attempt| async move {
            self.check().await.map_err(|error| {
                if error.is_fatal() {
                    RetryError::Fatal(error)
                } else {
                    RetryError::Transient(error)
                }
            })
        })
        .await?;

        if !outcome.is_success() {
            error!(
                attempts = outcome.attempts(),
                "could not validate CBGT pindex distribution"
            );
        }

        Ok(outcome.is_success())
    }

    /// Fetch diagnostics from every writer. Failures are recorded, never returned.
    pub async fn capture_diagnostics(&self) -> Vec<WriterDiagnostics> {
        let mut captured = Vec::with_capacity(self.writers.len());

        for writer in &self.writers {
            let node = writer.node_name().to_owned();

            match writer.get_cbgt_diagnostics().await {
                Ok(diagnostics) => {
                    let pretty = serde_json::to_string_pretty(&diagnostics).unwrap_or_default();
                    error!(node = %node, "CBGT diagnostic output: {}", pretty);
                    captured.push(WriterDiagnostics {
                        node,
                        diagnostics: Some(diagnostics),
                        error: None,
                    });
                }
                Err(fetch_error) => {
                    error!(node = %node, "failed to fetch CBGT diagnostics: {}", fetch_error);
                    captured.push(WriterDiagnostics {
                        node,
                        diagnostics: None,
                        error: Some(fetch_error.to_string()),
                    });
                }
            }
        }

        captured
    }
}
