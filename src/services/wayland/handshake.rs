use anyhow::{Result, anyhow, bail};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitingCapabilities,
    Ready,
    Failed(String),
}

impl HandshakeState {
    fn is_settled(&self) -> bool {
        matches!(self, HandshakeState::Ready | HandshakeState::Failed(_))
    }
}

pub fn channel() -> (watch::Sender<HandshakeState>, watch::Receiver<HandshakeState>) {
    watch::channel(HandshakeState::Connecting)
}

/// Waits until the dispatch thread reports `Ready`, giving up after `timeout`.
pub async fn wait_ready(
    mut state: watch::Receiver<HandshakeState>,
    timeout: Duration,
) -> Result<()> {
    let settled = tokio::time::timeout(timeout, state.wait_for(HandshakeState::is_settled))
        .await
        .map(|res| res.map(|settled| settled.clone()));

    let last = match settled {
        Ok(Ok(state)) => state,
        Ok(Err(_)) => bail!("Wayland dispatch thread exited during the handshake"),
        Err(_) => {
            let stuck_in = state.borrow().clone();
            return Err(anyhow!(
                "Timed out after {timeout:?} waiting for the compositor (still {stuck_in:?})"
            ));
        }
    };

    match last {
        HandshakeState::Ready => Ok(()),
        HandshakeState::Failed(reason) => bail!("Wayland handshake failed: {reason}"),
        other => bail!("Unexpected handshake state {other:?}"),
    }
}

const MAX_SETTLE_ROUNDS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStep {
    Again,
    Settled,
    GaveUp,
}

/// Decides when the initial roundtrips are done.
///
/// The state is complete once a roundtrip finishes without creating any new
/// proxy, since every object's initial events arrived during that round.
#[derive(Debug, Default)]
pub struct Settle {
    rounds: u32,
    created: usize,
}

impl Settle {
    /// Records a finished roundtrip with the total number of proxies created so far.
    pub fn step(&mut self, created: usize) -> SettleStep {
        self.rounds += 1;
        let grew = created != self.created;
        self.created = created;

        if !grew && self.rounds > 1 {
            SettleStep::Settled
        } else if self.rounds >= MAX_SETTLE_ROUNDS {
            SettleStep::GaveUp
        } else {
            SettleStep::Again
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}
