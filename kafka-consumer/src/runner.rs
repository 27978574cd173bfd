//! Handler runner
//!
//! Runs one record through the user handler. Each attempt is spawned onto the
//! runtime and raced against the per-record timeout; the attempt is never
//! cancelled, so a handler that overruns keeps going in the background after
//! the runner has moved on.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use futures::future::poll_fn;
use futures::FutureExt;
use tracing::{debug, error, warn, Instrument};

use crate::config::SubscriberConfig;
use crate::error::ConsumerError;
use crate::handler::{ErrorContext, ErrorHandler, Handler, NotificationHandler};
use crate::metrics_consts::{
    ERROR_HANDLER_FAILURES, HANDLER_ATTEMPT_DURATION_MS, HANDLER_OUTCOMES, HANDLER_RETRIES,
};
use crate::offsets::OffsetManager;
use crate::pause::PartitionController;
use crate::types::Record;

const BACKTRACE_NOT_CAPTURED: &str = "<backtrace not captured>";

static PANIC_HOOK_INSTALLED: Once = Once::new();

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the backtrace of panics raised while a
/// handler attempt is being polled on the current thread. Other panics go
/// straight to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK_INSTALLED.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let backtrace = Backtrace::force_capture().to_string();
                PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            }
            previous(info);
        }));
    });
}

struct PanicCapture {
    message: String,
    backtrace: String,
}

/// Drive `future` to completion, trapping a panic together with the backtrace
/// recorded at the panic site.
async fn trap_panic<F: Future>(future: F) -> Result<F::Output, PanicCapture> {
    let mut future = pin!(AssertUnwindSafe(future).catch_unwind());
    poll_fn(|cx| {
        CAPTURING.with(|capturing| capturing.set(true));
        let polled = future.as_mut().poll(cx);
        CAPTURING.with(|capturing| capturing.set(false));

        polled.map(|result| {
            result.map_err(|payload| PanicCapture {
                message: panic_message(payload.as_ref()),
                backtrace: PANIC_BACKTRACE
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| BACKTRACE_NOT_CAPTURED.to_string()),
            })
        })
    })
    .await
}

enum Attempt {
    Succeeded,
    TimedOut,
    Failed(ConsumerError),
}

pub struct HandlerRunner {
    handler: Handler,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    notification_handler: Option<Arc<dyn NotificationHandler>>,
    offsets: Arc<dyn OffsetManager>,
    controller: PartitionController,
    group: String,
    handler_timeout: Duration,
    error_handler_timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
}

impl HandlerRunner {
    pub(crate) fn new(
        config: &SubscriberConfig,
        handler: Handler,
        offsets: Arc<dyn OffsetManager>,
        controller: PartitionController,
    ) -> Self {
        install_panic_hook();
        Self {
            handler,
            error_handler: config.error_handler(),
            notification_handler: config.notification_handler(),
            offsets,
            controller,
            group: config.group.clone(),
            handler_timeout: config.handler_timeout,
            error_handler_timeout: config.error_handler_timeout,
            retry_count: config.retry_count,
            retry_delay: config.retry_delay,
        }
    }

    /// Run `record` to completion: offset hooks around the attempts, error report at the end.
    pub async fn run(&self, record: Arc<Record>) {
        let partition = record.partition().clone();
        let offset = record.offset();

        self.offsets.before_handler(&partition, offset);
        let result = self.run_attempts(&record).await;
        self.offsets.after_handler(&partition, offset);

        if let Err(error) = result {
            warn!(
                topic = record.topic(),
                partition = record.partition_number(),
                offset = record.offset(),
                transaction_id = record.transaction_id(),
                error = %error,
                "Record handling failed"
            );
            self.report_error(error, Some(record)).await;
        }
    }

    async fn run_attempts(&self, record: &Arc<Record>) -> Result<(), ConsumerError> {
        let max_attempts = self.retry_count.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = self.attempt(record.clone()).await;
            metrics::histogram!(HANDLER_ATTEMPT_DURATION_MS, "group" => self.group.clone())
                .record(started.elapsed().as_millis() as f64);

            match outcome {
                Attempt::Succeeded => {
                    metrics::counter!(HANDLER_OUTCOMES, "group" => self.group.clone(), "outcome" => "success")
                        .increment(1);
                    return Ok(());
                }
                Attempt::TimedOut => {
                    metrics::counter!(HANDLER_OUTCOMES, "group" => self.group.clone(), "outcome" => "timeout")
                        .increment(1);
                    debug!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset(),
                        transaction_id = record.transaction_id(),
                        timeout_ms = self.handler_timeout.as_millis() as u64,
                        "Handler timed out, skipping record"
                    );
                    return Ok(());
                }
                Attempt::Failed(error) => {
                    if attempt >= max_attempts {
                        let outcome = match error {
                            ConsumerError::HandlerPanic { .. } => "panic",
                            _ => "failure",
                        };
                        metrics::counter!(HANDLER_OUTCOMES, "group" => self.group.clone(), "outcome" => outcome)
                            .increment(1);
                        return Err(match error {
                            ConsumerError::Handler { source, .. } => ConsumerError::Handler {
                                attempts: attempt,
                                source,
                            },
                            other => other,
                        });
                    }

                    metrics::counter!(HANDLER_RETRIES, "group" => self.group.clone()).increment(1);
                    warn!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset(),
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %error,
                        "Handler attempt failed, retrying"
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
    }

    async fn attempt(&self, record: Arc<Record>) -> Attempt {
        let handler = self.handler.clone();
        let controller = self.controller.clone();
        let task = tokio::spawn(
            async move { trap_panic(handler.invoke(record, &controller)).await }
                .in_current_span(),
        );

        match tokio::time::timeout(self.handler_timeout, task).await {
            Err(_elapsed) => Attempt::TimedOut,
            Ok(Ok(Ok(Ok(())))) => Attempt::Succeeded,
            Ok(Ok(Ok(Err(source)))) => Attempt::Failed(ConsumerError::Handler {
                attempts: 1,
                source,
            }),
            Ok(Ok(Err(PanicCapture { message, backtrace }))) => {
                Attempt::Failed(ConsumerError::HandlerPanic { message, backtrace })
            }
            // the task itself was torn down, e.g. runtime shutdown
            Ok(Err(join_error)) => Attempt::Failed(ConsumerError::HandlerPanic {
                message: join_error.to_string(),
                backtrace: BACKTRACE_NOT_CAPTURED.to_string(),
            }),
        }
    }

    /// Hand `error` to the error handler under its own timeout. Without an error
    /// handler the error is logged instead.
    pub async fn report_error(&self, error: ConsumerError, record: Option<Arc<Record>>) {
        let Some(error_handler) = self.error_handler.clone() else {
            error!(group = %self.group, error = %error, "Unhandled subscriber error");
            return;
        };

        let context = ErrorContext {
            group: self.group.clone(),
            transaction_id: record.as_ref().map(|r| r.transaction_id().to_string()),
        };
        let task = tokio::spawn(
            async move {
                AssertUnwindSafe(error_handler.on_error(context, error, record))
                    .catch_unwind()
                    .await
            }
            .in_current_span(),
        );

        match tokio::time::timeout(self.error_handler_timeout, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(payload))) => {
                metrics::counter!(ERROR_HANDLER_FAILURES, "group" => self.group.clone(), "reason" => "panic")
                    .increment(1);
                error!(
                    group = %self.group,
                    panic = %panic_message(payload.as_ref()),
                    "Error handler panicked"
                );
            }
            Ok(Err(join_error)) => {
                metrics::counter!(ERROR_HANDLER_FAILURES, "group" => self.group.clone(), "reason" => "aborted")
                    .increment(1);
                error!(group = %self.group, error = %join_error, "Error handler task failed");
            }
            Err(_elapsed) => {
                metrics::counter!(ERROR_HANDLER_FAILURES, "group" => self.group.clone(), "reason" => "timeout")
                    .increment(1);
                error!(
                    group = %self.group,
                    timeout_ms = self.error_handler_timeout.as_millis() as u64,
                    "Error handler timed out"
                );
            }
        }
    }

    /// Pass a notice to the notification handler, trapping panics.
    pub fn notify(&self, notification: &str) {
        let Some(handler) = &self.notification_handler else {
            return;
        };
        if let Err(payload) =
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.notify(notification)))
        {
            error!(
                group = %self.group,
                panic = %panic_message(payload.as_ref()),
                "Notification handler panicked"
            );
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
