//! Effect runner for one recognition session
//!
//! Feeds events into the [`Session`] and executes the effects it returns.
//! The pacing timer, the silence timer, inbound messages and cancellation
//! are multiplexed on one task with `tokio::select!`:
//!
//! ```text
//!            ┌──────── pacing tick (every frame interval)
//!            ├──────── inbound message / close / error
//! select! ───┤
//!            ├──────── silence window elapsed (after LAST frame)
//!            └──────── cancellation token
//! ```

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use super::protocol::FrameEncoder;
use super::session::{Effect, Session, SessionEvent};
use super::transport::{Transport, TransportEvent, NORMAL_CLOSURE};
use super::{RecognitionError, SignedEndpoint};

/// Timing for one session
#[derive(Debug, Clone, Copy)]
pub(crate) struct DriverTiming {
    pub frame_interval: Duration,
    pub silence_timeout: Duration,
}

/// Run `session` to completion and return its single outcome
///
/// `connect` is called for the `Connect` effect and owns the retry policy.
/// Whatever the outcome, an open transport is closed before returning.
pub(crate) async fn drive<T, F, Fut>(
    mut session: Session,
    endpoint: SignedEndpoint,
    encoder: FrameEncoder,
    timing: DriverTiming,
    cancel: CancellationToken,
    connect: F,
) -> Result<String, RecognitionError>
where
    T: Transport,
    F: Fn(SignedEndpoint) -> Fut,
    Fut: Future<Output = Result<T, RecognitionError>>,
{
    let mut transport: Option<T> = None;
    let result = run(
        &mut session,
        &mut transport,
        endpoint,
        &encoder,
        timing,
        &cancel,
        connect,
    )
    .await;

    if let Some(mut t) = transport.take() {
        t.close(NORMAL_CLOSURE).await;
    }

    match &result {
        Ok(text) => log::info!(
            "Driver: session finished ({} frames, {} chars)",
            session.frames_sent(),
            text.len()
        ),
        Err(e) => log::warn!("Driver: session failed in {}: {}", session.state(), e),
    }
    result
}

async fn run<T, F, Fut>(
    session: &mut Session,
    transport: &mut Option<T>,
    endpoint: SignedEndpoint,
    encoder: &FrameEncoder,
    timing: DriverTiming,
    cancel: &CancellationToken,
    connect: F,
) -> Result<String, RecognitionError>
where
    T: Transport,
    F: Fn(SignedEndpoint) -> Fut,
    Fut: Future<Output = Result<T, RecognitionError>>,
{
    let mut pacing: Option<Interval> = None;
    let mut silence: Option<Pin<Box<Sleep>>> = None;

    let mut queue: VecDeque<Effect> = session.handle(SessionEvent::Start { endpoint })?.into();

    loop {
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Connect { endpoint } => {
                    let event = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => SessionEvent::Cancel,
                        result = connect(endpoint) => match result {
                            Ok(t) => {
                                *transport = Some(t);
                                SessionEvent::TransportOpened
                            }
                            Err(error) => SessionEvent::TransportError { error },
                        },
                    };
                    queue.extend(session.handle(event)?);
                }
                Effect::Send(frame) => {
                    let Some(t) = transport.as_mut() else {
                        continue;
                    };
                    let result = match encoder.encode(&frame) {
                        Ok(text) => t.send_text(text).await,
                        Err(e) => Err(RecognitionError::Transport(format!(
                            "Failed to encode frame {}: {}",
                            frame.sequence, e
                        ))),
                    };
                    if let Err(error) = result {
                        queue.clear();
                        queue.extend(session.handle(SessionEvent::TransportError { error })?);
                    }
                }
                Effect::StartPacing => {
                    let period = timing.frame_interval;
                    let mut ticker = interval_at(Instant::now() + period, period);
                    // Late ticks must not burst: keep the real-time spacing.
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    pacing = Some(ticker);
                }
                Effect::StopPacing => {
                    pacing = None;
                }
                Effect::ArmSilenceTimer => {
                    silence = Some(Box::pin(sleep(timing.silence_timeout)));
                }
                Effect::Close { code } => {
                    if let Some(mut t) = transport.take() {
                        t.close(code).await;
                    }
                }
                Effect::Finish(result) => return result,
            }
        }

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => SessionEvent::Cancel,
            event = next_inbound(transport) => match event {
                TransportEvent::Message(text) => SessionEvent::Inbound { text },
                TransportEvent::Closed { code, reason } => {
                    // Already closed by the peer; nothing left to close.
                    *transport = None;
                    SessionEvent::TransportClosed { code, reason }
                }
                TransportEvent::Error(error) => SessionEvent::TransportError { error },
            },
            _ = next_tick(&mut pacing) => SessionEvent::PacingTick,
            _ = silence_elapsed(&mut silence) => {
                silence = None;
                SessionEvent::SilenceElapsed
            }
        };

        queue.extend(session.handle(event)?);
    }
}

async fn next_inbound<T: Transport>(transport: &mut Option<T>) -> TransportEvent {
    match transport.as_mut() {
        Some(t) => t.next_event().await,
        None => pending().await,
    }
}

async fn next_tick(pacing: &mut Option<Interval>) {
    match pacing.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn silence_elapsed(silence: &mut Option<Pin<Box<Sleep>>>) {
    match silence.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}
