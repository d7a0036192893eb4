//! Request execution with correction and retry
//!
//! [`RequestExecutor::execute`] drives one [`Operation`] to a final response.
//! Two failure families are corrected in place and share one small budget:
//!
//! - **Addressing**: the bucket lives in another region. The authoritative
//!   region is taken from the response (or, when the response names none,
//!   from a `HEAD` bucket lookup), recorded in the [`RegionResolver`] and the
//!   request is re-signed for it.
//! - **Signer negotiation**: the legacy scheme was rejected. The request is
//!   re-signed with the newer scheme for the same region.
//!
//! Transport failures and throttling are retried under a separate
//! [`BackoffPolicy`] budget. Before every retry the request body is rewound to
//! its checkpoint; a body that cannot be rewound ends the sequence with
//! [`StratusError::UnrecoverableStreamState`].

use crate::body::{PayloadHash, ReplayableBody};
use crate::config::ClientConfig;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::{Result, StratusError};
use crate::region::RegionResolver;
use crate::signer::{SignableRequest, SignerKind, SignerNegotiator, SigningContext};
use crate::transport::{
    classify, Classified, EndpointResolver, Operation, ResponseDescriptor, SignedRequest,
    Transport,
};
use chrono::{DateTime, Utc};
use http::Method;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use stratus_core_resilience::{BackoffPolicy, Clock, RetryBudget, TokioClock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Wrong region; retried against the authoritative one
    Redirect,
    /// Scheme rejected; retried with the newer scheme
    AuthRetry,
    /// Transport failure or throttling; retried after backoff
    TransportRetry,
    Fatal,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::Redirect => write!(f, "redirect"),
            AttemptOutcome::AuthRetry => write!(f, "auth-retry"),
            AttemptOutcome::TransportRetry => write!(f, "transport-retry"),
            AttemptOutcome::Fatal => write!(f, "fatal"),
        }
    }
}

/// One try of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based
    pub number: u32,
    pub scheme: SignerKind,
    /// Region placed in the signature scope
    pub region: String,
    pub outcome: AttemptOutcome,
}

/// Final response plus the attempts that led to it
#[derive(Debug, Clone)]
pub struct Execution {
    pub response: ResponseDescriptor,
    pub attempts: Vec<AttemptRecord>,
}

impl Execution {
    /// Attempts that ended in a region correction
    pub fn redirects(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Redirect)
            .count()
    }
}

/// Drives operations through sign, send, classify and retry
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    config: ClientConfig,
    regions: Arc<RegionResolver>,
    negotiator: SignerNegotiator,
    endpoints: EndpointResolver,
    backoff: BackoffPolicy,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
}

impl RequestExecutor {
    /// Create an executor with its own region cache and the tokio clock
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            regions: Arc::new(RegionResolver::new()),
            negotiator: SignerNegotiator::from_config(&config),
            endpoints: EndpointResolver::from_config(&config)?,
            backoff: config.backoff_policy(),
            transport,
            credentials,
            clock: Arc::new(TokioClock),
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a region cache with other executors of the same client
    pub fn with_region_resolver(mut self, regions: Arc<RegionResolver>) -> Self {
        self.regions = regions;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn regions(&self) -> &Arc<RegionResolver> {
        &self.regions
    }

    /// Body over a forward-only reader, replayable up to the configured
    /// reset limit
    pub fn body_from_reader<R>(&self, reader: R) -> ReplayableBody
    where
        R: Read + Send + 'static,
    {
        ReplayableBody::from_reader(reader, self.config.reset_limit)
    }

    /// Execute `operation` to a final response
    ///
    /// The body, if any, is checkpointed at its current position before the
    /// first attempt and rewound there before every retry.
    pub async fn execute(
        &self,
        operation: &Operation,
        mut body: Option<&mut ReplayableBody>,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let pinned = operation
            .region_override
            .clone()
            .or_else(|| self.config.region.clone());
        let region = pinned
            .clone()
            .or_else(|| self.regions.resolve(&operation.bucket));
        let mut context = self.negotiator.initial_context(&operation.headers, region);

        if let Some(body) = body.as_deref_mut() {
            body.checkpoint();
        }

        let mut corrective = RetryBudget::new(self.config.max_corrective_retries);
        let mut transport_retries = RetryBudget::new(self.backoff.max_retries);
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                rewind_quietly(body.as_deref_mut());
                return Err(StratusError::Cancelled);
            }

            let number = attempts.len() as u32 + 1;
            debug!(
                operation = operation.name,
                bucket = %operation.bucket,
                attempt = number,
                scheme = %context.scheme,
                region = %context.signing_region,
                "Sending request"
            );

            let sent = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.attempt(operation, &context, body.as_deref_mut()) => Some(result),
            };
            let Some(sent) = sent else {
                rewind_quietly(body.as_deref_mut());
                return Err(StratusError::Cancelled);
            };

            let mut record = AttemptRecord {
                number,
                scheme: context.scheme,
                region: context.signing_region.clone(),
                outcome: AttemptOutcome::Fatal,
            };

            let response = match sent {
                Ok(response) => response,
                Err(err) if err.is_retryable() => {
                    record.outcome = AttemptOutcome::TransportRetry;
                    attempts.push(record);
                    self.back_off(
                        operation,
                        &mut transport_retries,
                        err,
                        attempts.len(),
                        body.as_deref_mut(),
                        cancel,
                    )
                    .await?;
                    continue;
                }
                Err(err) => {
                    warn!(operation = operation.name, bucket = %operation.bucket, error = %err, "Request failed");
                    return Err(err);
                }
            };

            match classify(&response, &context) {
                Classified::Success => {
                    if pinned.is_none() {
                        if let Some(region) = response.bucket_region() {
                            if self.regions.resolve(&operation.bucket).as_deref()
                                != Some(region.as_str())
                            {
                                self.regions.record(&operation.bucket, &region);
                            }
                        }
                    }
                    record.outcome = AttemptOutcome::Success;
                    attempts.push(record);
                    debug!(
                        operation = operation.name,
                        bucket = %operation.bucket,
                        attempts = attempts.len(),
                        status = response.status.as_u16(),
                        "Request succeeded"
                    );
                    return Ok(Execution { response, attempts });
                }

                Classified::Redirect { region } => {
                    let attempted = context.signing_region.clone();
                    if pinned.is_some() {
                        return Err(StratusError::Addressing {
                            bucket: operation.bucket.clone(),
                            attempted,
                            authoritative: region.unwrap_or_else(|| "unknown".to_string()),
                        });
                    }

                    let authoritative = match region {
                        Some(region) => Some(region),
                        None => match self.lookup_region(operation, &context, cancel).await {
                            Ok(found) => found,
                            Err(err) if err.is_retryable() => {
                                record.outcome = AttemptOutcome::TransportRetry;
                                attempts.push(record);
                                self.back_off(
                                    operation,
                                    &mut transport_retries,
                                    err,
                                    attempts.len(),
                                    body.as_deref_mut(),
                                    cancel,
                                )
                                .await?;
                                continue;
                            }
                            Err(err) => {
                                rewind_quietly(body.as_deref_mut());
                                return Err(err);
                            }
                        },
                    };
                    let addressing = StratusError::Addressing {
                        bucket: operation.bucket.clone(),
                        attempted: attempted.clone(),
                        authoritative: authoritative
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                    };
                    let Some(authoritative) = authoritative else {
                        return Err(addressing);
                    };

                    record.outcome = AttemptOutcome::Redirect;
                    attempts.push(record);
                    if !corrective.try_consume() {
                        return Err(StratusError::Exhausted {
                            attempts: attempts.len() as u32,
                            source: Box::new(addressing),
                        });
                    }

                    info!(
                        bucket = %operation.bucket,
                        from = %attempted,
                        to = %authoritative,
                        "Correcting bucket region"
                    );
                    self.regions.record(&operation.bucket, &authoritative);
                    context = context.with_region(&authoritative);
                    rewind(body.as_deref_mut())?;
                }

                Classified::Auth { code, message } => {
                    let rejected = StratusError::AuthNegotiation {
                        scheme: context.scheme,
                        code,
                        message,
                    };
                    let Some(next) = self.negotiator.after_auth_failure(&context) else {
                        return Err(rejected);
                    };

                    record.outcome = AttemptOutcome::AuthRetry;
                    attempts.push(record);
                    if !corrective.try_consume() {
                        return Err(StratusError::Exhausted {
                            attempts: attempts.len() as u32,
                            source: Box::new(rejected),
                        });
                    }

                    warn!(
                        bucket = %operation.bucket,
                        from = %context.scheme,
                        to = %next.scheme,
                        "Signature scheme rejected; re-signing"
                    );
                    context = next;
                    rewind(body.as_deref_mut())?;
                }

                Classified::Throttled(err) => {
                    record.outcome = AttemptOutcome::TransportRetry;
                    attempts.push(record);
                    self.back_off(
                        operation,
                        &mut transport_retries,
                        err,
                        attempts.len(),
                        body.as_deref_mut(),
                        cancel,
                    )
                    .await?;
                }

                Classified::Fatal(err) => {
                    debug!(operation = operation.name, bucket = %operation.bucket, error = %err, "Request failed");
                    return Err(err);
                }
            }
        }
    }

    /// Sign and send one attempt under the per-attempt deadline
    async fn attempt(
        &self,
        operation: &Operation,
        context: &SigningContext,
        mut body: Option<&mut ReplayableBody>,
    ) -> Result<ResponseDescriptor> {
        let credentials = self.credentials.current_credentials().await?;
        let payload_hash = match (context.scheme, body.as_deref_mut()) {
            (_, None) => PayloadHash::empty(),
            (SignerKind::V4, Some(body)) => body.payload_hash()?,
            (SignerKind::V2, Some(_)) => PayloadHash::Unsigned,
        };

        let request = self.sign(operation, context, &payload_hash, &credentials)?;
        let timeout = self.config.attempt_timeout();
        match tokio::time::timeout(timeout, self.transport.send(&request, body)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StratusError::Timeout(timeout)),
        }
    }

    fn sign(
        &self,
        operation: &Operation,
        context: &SigningContext,
        payload_hash: &PayloadHash,
        credentials: &Credentials,
    ) -> Result<SignedRequest> {
        let url = self
            .endpoints
            .url_for(operation, context.region.as_deref())?;
        let resource_path = operation.resource_path();
        let time: DateTime<Utc> = self.clock.now().into();

        let mut signable = SignableRequest {
            method: &operation.method,
            url: &url,
            resource_path: &resource_path,
            query: &operation.query,
            headers: operation.headers.clone(),
            payload_hash,
        };
        self.negotiator
            .sign(&mut signable, credentials, context, time)?;
        let headers = signable.headers;

        Ok(SignedRequest {
            method: operation.method.clone(),
            url,
            headers,
            bucket: operation.bucket.clone(),
            key: operation.key.clone(),
            query: operation.query.clone(),
            context: context.clone(),
        })
    }

    /// Spend one transport retry, rewind the body and sleep; surfaces the
    /// last cause once the budget is gone
    async fn back_off(
        &self,
        operation: &Operation,
        budget: &mut RetryBudget,
        cause: StratusError,
        attempts: usize,
        body: Option<&mut ReplayableBody>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !budget.try_consume() {
            warn!(
                operation = operation.name,
                bucket = %operation.bucket,
                attempts,
                error = %cause,
                "Retries exhausted"
            );
            return Err(StratusError::Exhausted {
                attempts: attempts as u32,
                source: Box::new(cause),
            });
        }

        rewind(body)?;

        let delay = self.backoff.delay_for(budget.used());
        debug!(
            operation = operation.name,
            bucket = %operation.bucket,
            retry = budget.used(),
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Retrying after transient failure"
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(StratusError::Cancelled),
            _ = self.clock.sleep(delay) => Ok(()),
        }
    }

    /// Ask the provider where the bucket lives when a redirect named no region
    ///
    /// `Ok(None)` means the provider answered without naming one; a failed
    /// lookup surfaces its own cause.
    async fn lookup_region(
        &self,
        operation: &Operation,
        context: &SigningContext,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let probe = Operation::new("HeadBucket", Method::HEAD, operation.bucket.clone());
        debug!(bucket = %operation.bucket, "Redirect without region; looking up bucket region");

        let sent = tokio::select! {
            _ = cancel.cancelled() => return Err(StratusError::Cancelled),
            sent = self.attempt(&probe, context, None) => sent,
        };
        match sent {
            Ok(response) => Ok(response.bucket_region()),
            Err(err) => {
                warn!(bucket = %operation.bucket, error = %err, "Bucket region lookup failed");
                Err(err)
            }
        }
    }
}

fn rewind(body: Option<&mut ReplayableBody>) -> Result<()> {
    if let Some(body) = body {
        body.reset()?;
    }
    Ok(())
}

fn rewind_quietly(body: Option<&mut ReplayableBody>) {
    if let Some(body) = body {
        if body.can_reset() {
            let _ = body.reset();
        }
    }
}
