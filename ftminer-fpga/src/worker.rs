//! The per-chain mining loop and the channels that feed it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ftminer_io::{Bus, Hex, Transport};
use smol::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, info, instrument, warn};

use crate::{Error, Fpga, Golden, Job, Result};

/// Golden nonces a worker can queue before it starts dropping them.
pub const NONCE_CAPACITY: usize = 64;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct Stats {
    read: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Nonces taken off the firmware's queue.
    pub read: u64,
    pub valid: u64,
    /// Nonces that did not meet their job's target.
    pub invalid: u64,
    /// Valid nonces lost to a full or closed golden nonce channel.
    pub dropped: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read: self.read.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// The sending side of a worker's job slot.
///
/// The slot holds one job. Submitting while it is occupied replaces the
/// waiting job, since only the newest work is worth loading.
pub struct JobSender {
    tx: Sender<Arc<Job>>,
    rx: Receiver<Arc<Job>>,
}

impl JobSender {
    pub fn submit(&self, mut job: Arc<Job>) -> Result<()> {
        // our own receiver doesn't count
        if self.tx.receiver_count() <= 1 {
            return Err(Error::Disconnected);
        }
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        debug!("replaced waiting job");
                    }
                    job = back;
                }
                Err(TrySendError::Closed(_)) => return Err(Error::Disconnected),
            }
        }
    }
}

/// A one-job slot. Dropping every [`JobSender`] stops the worker.
pub fn job_channel() -> (JobSender, Receiver<Arc<Job>>) {
    let (tx, rx) = channel::bounded(1);
    (
        JobSender {
            tx,
            rx: rx.clone(),
        },
        rx,
    )
}

/// Golden nonces out of a worker. The worker never waits on this channel:
/// when it is full, new nonces are dropped and counted.
pub fn nonce_channel(capacity: usize) -> (Sender<Golden>, Receiver<Golden>) {
    channel::bounded(capacity.max(1))
}

/// Mines on one FPGA. Any number of miners can share a [`Bus`]; each takes
/// the bus for one full load-and-poll transaction at a time.
pub struct Miner<T> {
    bus: Arc<Bus<T>>,
    fpga: Fpga,
    jobs: Receiver<Arc<Job>>,
    golden: Sender<Golden>,
    stats: Arc<Stats>,
    poll: Duration,
    current: Option<Arc<Job>>,
}

impl<T: Transport> Miner<T> {
    pub fn new(
        bus: Arc<Bus<T>>,
        fpga: Fpga,
        jobs: Receiver<Arc<Job>>,
        golden: Sender<Golden>,
    ) -> Self {
        Self {
            bus,
            fpga,
            jobs,
            golden,
            stats: Arc::default(),
            poll: POLL_INTERVAL,
            current: None,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn fpga(&self) -> &Fpga {
        &self.fpga
    }

    /// One round: load a new job if one is waiting, then poll for a nonce.
    /// Returns `false` once every job sender is gone.
    pub async fn step(&mut self) -> Result<bool> {
        let next = match self.jobs.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => return Ok(false),
        };

        let mut session = self.bus.session().await;
        if let Some(job) = next {
            // whatever the old job found before it is replaced
            if let Some(current) = self.current.take()
                && let Some(nonce) = self.fpga.read_nonce(&mut *session).await?
            {
                self.found(nonce, current);
            }
            self.fpga.write_job(&mut *session, &job).await?;
            self.current = Some(job);
        }
        if let Some(current) = self.current.clone()
            && let Some(nonce) = self.fpga.read_nonce(&mut *session).await?
        {
            self.found(nonce, current);
        }
        Ok(true)
    }

    fn found(&self, nonce: u32, job: Arc<Job>) {
        self.stats.read.fetch_add(1, Ordering::Relaxed);
        if !job.check(nonce) {
            self.stats.invalid.fetch_add(1, Ordering::Relaxed);
            warn!(part = self.fpga.part(), nonce = %Hex(nonce), "nonce does not meet target");
            return;
        }
        self.stats.valid.fetch_add(1, Ordering::Relaxed);
        match self.golden.try_send(Golden { nonce, job }) {
            Ok(()) => info!(part = self.fpga.part(), nonce = %Hex(nonce), "golden nonce"),
            Err(TrySendError::Full(golden)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                let e = Error::QueueFull {
                    nonce: golden.nonce,
                };
                warn!(part = self.fpga.part(), %e);
            }
            Err(TrySendError::Closed(golden)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(nonce = %Hex(golden.nonce), "nobody is collecting golden nonces");
            }
        }
    }

    /// Clear out stale nonces, then mine until the job senders are dropped.
    /// Hands the FPGA back, still awake and working on the last job.
    #[instrument(skip_all, fields(part = self.fpga.part()))]
    pub async fn run(mut self) -> Result<Fpga> {
        self.fpga.clear_queue(&mut *self.bus.session().await).await?;
        info!(framing = %self.fpga.framing(), "mining");
        while self.step().await? {
            smol::Timer::after(self.poll).await;
        }
        let stats = self.stats.snapshot();
        info!(?stats, "job source closed");
        Ok(self.fpga)
    }
}

#[cfg(test)]
mod tests {
    use ftminer_io::{
        Chain, Config, Controller, Link, PinAssignment, Select, devices,
        sim::{SimDevice, SimTransport},
    };

    use super::*;
    use crate::{
        firmware::{Legacy, genesis, share_target},
        framing::legacy_words,
    };

    struct Rig {
        firmware: Legacy,
        jobs: JobSender,
        golden: Receiver<Golden>,
        miner: Miner<SimTransport>,
    }

    async fn rig(capacity: usize) -> Rig {
        let firmware = Legacy::default();
        let device = SimDevice::spartan6(0x0401D093).with_user_logic(firmware.clone());
        let sim = SimTransport::new(PinAssignment::X6500).with_chain(Chain::Zero, vec![device]);
        let mut link = Link::open(sim, &PinAssignment::X6500, Config::default())
            .await
            .unwrap();
        let pins = PinAssignment::X6500.pins(Select::Single(Chain::Zero));
        let jtag = Controller::new(pins, devices::table());
        let fpga = Fpga::attach(&mut link, jtag, 0).await.unwrap();

        let bus = Arc::new(Bus::new(link));
        let (jobs, job_rx) = job_channel();
        let (golden_tx, golden) = nonce_channel(capacity);
        let miner = Miner::new(bus, fpga, job_rx, golden_tx).with_poll_interval(Duration::ZERO);
        Rig {
            firmware,
            jobs,
            golden,
            miner,
        }
    }

    #[test]
    fn loads_jobs_and_reports_nonces() {
        smol::block_on(async {
            let mut rig = rig(NONCE_CAPACITY).await;
            let (job, nonce) = genesis(share_target());
            let job = Arc::new(job);

            rig.jobs.submit(job.clone()).unwrap();
            assert!(rig.miner.step().await.unwrap());
            assert_eq!(rig.firmware.state().words, legacy_words(&job));

            rig.firmware.push_nonce(nonce);
            assert!(rig.miner.step().await.unwrap());
            let golden = rig.golden.try_recv().unwrap();
            assert_eq!(golden.nonce, nonce);
            assert!(Arc::ptr_eq(&golden.job, &job));

            rig.firmware.push_nonce(nonce ^ 0x8000_0000);
            rig.miner.step().await.unwrap();
            assert!(rig.golden.try_recv().is_err());
            let stats = rig.miner.stats().snapshot();
            assert_eq!(
                stats,
                StatsSnapshot {
                    read: 2,
                    valid: 1,
                    invalid: 1,
                    dropped: 0
                }
            );
        });
    }

    #[test]
    fn newest_job_wins() {
        smol::block_on(async {
            let mut rig = rig(NONCE_CAPACITY).await;
            let (first, _) = genesis(share_target());
            let mut second = first.clone();
            second.midstate = [0x55; 32];

            rig.jobs.submit(Arc::new(first)).unwrap();
            rig.jobs.submit(Arc::new(second.clone())).unwrap();
            rig.miner.step().await.unwrap();
            assert_eq!(rig.firmware.state().words, legacy_words(&second));
        });
    }

    #[test]
    fn nonce_for_the_replaced_job() {
        smol::block_on(async {
            let mut rig = rig(NONCE_CAPACITY).await;
            let (old, nonce) = genesis(share_target());
            let old = Arc::new(old);
            rig.jobs.submit(old.clone()).unwrap();
            rig.miner.step().await.unwrap();

            rig.firmware.push_nonce(nonce);
            let mut new = (*old).clone();
            new.midstate = [0x66; 32];
            rig.jobs.submit(Arc::new(new)).unwrap();
            rig.miner.step().await.unwrap();

            // credited to the job it was found for
            let golden = rig.golden.try_recv().unwrap();
            assert!(Arc::ptr_eq(&golden.job, &old));
        });
    }

    #[test]
    fn full_nonce_channel_drops() {
        smol::block_on(async {
            let mut rig = rig(1).await;
            let (job, nonce) = genesis(share_target());
            rig.jobs.submit(Arc::new(job)).unwrap();
            rig.miner.step().await.unwrap();

            for _ in 0..2 {
                rig.firmware.push_nonce(nonce);
                rig.miner.step().await.unwrap();
            }
            assert_eq!(rig.miner.stats().snapshot().dropped, 1);
            assert_eq!(rig.golden.len(), 1);
        });
    }

    #[test]
    fn stops_when_job_source_closes() {
        smol::block_on(async {
            let rig = rig(NONCE_CAPACITY).await;
            rig.firmware.push_nonce(1);
            drop(rig.jobs);
            let fpga = rig.miner.run().await.unwrap();
            assert!(!fpga.is_asleep());
            // startup clears nonces left over from before
            assert!(rig.firmware.state().queue.is_empty());
        });
    }

    #[test]
    fn submit_without_worker() {
        let (jobs, rx) = job_channel();
        drop(rx);
        let (job, _) = genesis(share_target());
        assert!(matches!(
            jobs.submit(Arc::new(job)),
            Err(Error::Disconnected)
        ));
    }
}
