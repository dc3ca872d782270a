//! Background volume uploads.
//!
//! Sealed volumes go through a bounded channel to a small pool of worker
//! threads, so the walker stalls once `queue` volumes are waiting instead
//! of buffering the whole backup in memory. Completions come back on an
//! unbounded channel and are applied to the catalog by the caller between
//! units of work. A worker never gives up halfway through a volume; when
//! cancelled it only skips volumes it has not started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use strata_config::log_upload_debug;
use strata_pack::SealedVolume;

use crate::remote::RemoteStore;
use crate::{EngineError, Result};

/// Result of one volume upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub volume: String,
    pub block_count: usize,
    /// Bytes stored remotely.
    pub result: Result<u64>,
}

pub struct Uploader {
    jobs: Option<Sender<SealedVolume>>,
    outcomes: Receiver<UploadOutcome>,
    cancel: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    submitted: usize,
    received: usize,
}

impl Uploader {
    pub fn start(remote: RemoteStore, workers: usize, queue: usize) -> Self {
        let (job_tx, job_rx) = bounded::<SealedVolume>(queue.max(1));
        let (outcome_tx, outcome_rx) = unbounded::<UploadOutcome>();
        let cancel = Arc::new(AtomicBool::new(false));

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = job_rx.clone();
                let tx = outcome_tx.clone();
                let remote = remote.clone();
                let cancel = cancel.clone();
                thread::spawn(move || {
                    for volume in rx.iter() {
                        let result = if cancel.load(Ordering::SeqCst) {
                            Err(EngineError::Aborted)
                        } else {
                            log_upload_debug!(
                                "uploading volume",
                                worker = id,
                                volume = volume.name.as_str(),
                                bytes = volume.bytes.len()
                            );
                            remote.put_volume(&volume.name, &volume.bytes)
                        };
                        let outcome = UploadOutcome {
                            block_count: volume.block_count(),
                            volume: volume.name,
                            result,
                        };
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            cancel,
            workers: handles,
            submitted: 0,
            received: 0,
        }
    }

    /// Queue a volume, blocking while the queue is full.
    pub fn submit(&mut self, volume: SealedVolume) -> Result<()> {
        let Some(jobs) = &self.jobs else {
            return Err(EngineError::UploaderClosed("uploader already closed".into()));
        };
        jobs.send(volume)
            .map_err(|_| EngineError::UploaderClosed("upload workers exited".into()))?;
        self.submitted += 1;
        Ok(())
    }

    /// Completions available right now, without waiting.
    pub fn poll(&mut self) -> Vec<UploadOutcome> {
        let out: Vec<UploadOutcome> = self.outcomes.try_iter().collect();
        self.received += out.len();
        out
    }

    /// Volumes submitted but not yet reported back.
    pub fn pending(&self) -> usize {
        self.submitted - self.received
    }

    /// Wait for every queued volume and return the remaining completions.
    pub fn finish(mut self) -> Vec<UploadOutcome> {
        self.shutdown();
        self.drain()
    }

    /// Let in-flight uploads complete, skip queued ones.
    pub fn abort(mut self) -> Vec<UploadOutcome> {
        self.cancel.store(true, Ordering::SeqCst);
        self.shutdown();
        self.drain()
    }

    fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn drain(&mut self) -> Vec<UploadOutcome> {
        let out: Vec<UploadOutcome> = self.outcomes.try_iter().collect();
        self.received += out.len();
        out
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend, RetryPolicy};
    use strata_pack::VolumePacker;

    fn sealed(packer: &mut VolumePacker, seed: u8) -> SealedVolume {
        let data = vec![seed; 64];
        packer.add(strata_cas::digest(&data), &data);
        packer.finalize_open_volume().unwrap().unwrap()
    }

    #[test]
    fn test_uploads_everything_on_finish() {
        let backend = Arc::new(MemoryBackend::new());
        let remote = RemoteStore::new(backend.clone(), None, RetryPolicy::immediate(0), "up");
        let mut uploader = Uploader::start(remote, 2, 1);
        let mut packer = VolumePacker::new("up", 1024);

        let mut names = Vec::new();
        for seed in 0..5 {
            let v = sealed(&mut packer, seed);
            names.push(v.name.clone());
            uploader.submit(v).unwrap();
        }
        let mut outcomes = uploader.poll();
        outcomes.extend(uploader.finish());
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.result.is_ok() && o.block_count == 1));
        for name in names {
            assert!(backend.contains(&name));
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_puts(2);
        let remote = RemoteStore::new(backend.clone(), None, RetryPolicy::immediate(3), "up");
        let mut uploader = Uploader::start(remote, 1, 1);
        let mut packer = VolumePacker::new("up", 1024);
        uploader.submit(sealed(&mut packer, 9)).unwrap();
        let outcomes = uploader.finish();
        assert!(outcomes[0].result.is_ok());
        assert_eq!(backend.put_count(), 1);
        assert_eq!(backend.list().unwrap().len(), 1);
    }

    #[test]
    fn test_submit_after_workers_exit_is_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        let remote = RemoteStore::new(backend, None, RetryPolicy::immediate(0), "up");
        let mut uploader = Uploader::start(remote, 1, 1);
        let (orphaned, gone) = bounded::<SealedVolume>(1);
        drop(gone);
        uploader.jobs = Some(orphaned);

        let mut packer = VolumePacker::new("up", 1024);
        let err = uploader.submit(sealed(&mut packer, 3)).unwrap_err();
        assert!(matches!(err, EngineError::UploaderClosed(_)));
        assert!(err.is_fatal());
        assert_eq!(uploader.pending(), 0);
    }

    #[test]
    fn test_exhausted_retries_reported() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_puts(10);
        let remote = RemoteStore::new(backend, None, RetryPolicy::immediate(1), "up");
        let mut uploader = Uploader::start(remote, 1, 1);
        let mut packer = VolumePacker::new("up", 1024);
        uploader.submit(sealed(&mut packer, 1)).unwrap();
        let outcomes = uploader.finish();
        assert!(matches!(
            outcomes[0].result,
            Err(EngineError::TransientBackend { attempts: 2, .. })
        ));
    }
}
