use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use imucal_core::{FitRequest, FitResult};
use tracing::debug;

/// Runs ellipsoid fits on a dedicated thread so the sample path never waits
/// on one.
///
/// Only one request is in flight at a time. Callers check [`FitWorker::is_busy`]
/// before submitting; a request submitted while busy is rejected and handed back.
pub struct FitWorker {
    request_sender: Option<Sender<FitRequest>>,
    result_receiver: Receiver<FitResult>,
    handle: Option<JoinHandle<usize>>,
    in_flight: bool,
}

impl FitWorker {
    pub fn spawn() -> Self {
        let (request_sender, request_receiver) = channel::<FitRequest>();
        let (result_sender, result_receiver) = channel();

        let handle = thread::spawn(move || {
            let mut fits = 0;
            // Runs until the request sender is dropped.
            while let Ok(request) = request_receiver.recv() {
                let result = request.run();
                fits += 1;
                if result_sender.send(result).is_err() {
                    break;
                }
            }
            fits
        });

        Self {
            request_sender: Some(request_sender),
            result_receiver,
            handle: Some(handle),
            in_flight: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Hands `request` to the worker thread. Returns it back if a fit is
    /// already running or the thread has gone away.
    pub fn submit(&mut self, request: FitRequest) -> Result<(), FitRequest> {
        if self.in_flight {
            return Err(request);
        }
        let Some(sender) = &self.request_sender else {
            return Err(request);
        };
        match sender.send(request) {
            Ok(()) => {
                self.in_flight = true;
                Ok(())
            }
            Err(e) => Err(e.0),
        }
    }

    /// Returns the finished fit, if there is one, without blocking.
    pub fn try_result(&mut self) -> Option<FitResult> {
        match self.result_receiver.try_recv() {
            Ok(result) => {
                self.in_flight = false;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.in_flight = false;
                None
            }
        }
    }

    /// Waits up to `timeout` for the in-flight fit.
    pub fn wait_result(&mut self, timeout: Duration) -> Option<FitResult> {
        if !self.in_flight {
            return None;
        }
        match self.result_receiver.recv_timeout(timeout) {
            Ok(result) => {
                self.in_flight = false;
                Some(result)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.in_flight = false;
                None
            }
        }
    }

    /// Stops the thread after any in-flight fit completes and returns how many
    /// fits it ran.
    pub fn shutdown(&mut self) -> usize {
        // Dropping the sender ends the worker's recv loop.
        self.request_sender = None;
        let fits = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(0),
            None => 0,
        };
        self.in_flight = false;
        debug!(fits, "Fit worker stopped");
        fits
    }
}

impl Drop for FitWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn sphere_request(session: u64, radius: f64, center: Vector3<f64>) -> FitRequest {
        let points: Vec<Vector3<f64>> = (0..40)
            .map(|i| {
                let z = 1.0 - 2.0 * (i as f64 + 0.5) / 40.0;
                let r = (1.0 - z * z).sqrt();
                let theta = 2.399963229728653 * i as f64;
                Vector3::new(r * theta.cos(), r * theta.sin(), z) * radius + center
            })
            .collect();
        FitRequest {
            session,
            accel: points.clone(),
            mag: points,
        }
    }

    #[test]
    fn runs_a_fit_off_thread() {
        let mut worker = FitWorker::spawn();
        let center = Vector3::new(1.0, -2.0, 0.5);
        worker.submit(sphere_request(3, 2.0, center)).unwrap();
        assert!(worker.is_busy());

        let result = worker.wait_result(Duration::from_secs(5)).unwrap();
        assert!(!worker.is_busy());
        assert_eq!(result.session, 3);
        assert_eq!(result.sample_count, 40);
        let mag = result.mag.unwrap();
        assert!((mag.offset - center).norm() < 1e-6);

        assert_eq!(worker.shutdown(), 1);
    }

    #[test]
    fn rejects_a_second_request_while_busy() {
        let mut worker = FitWorker::spawn();
        worker.submit(sphere_request(1, 1.0, Vector3::zeros())).unwrap();

        let rejected = worker.submit(sphere_request(2, 1.0, Vector3::zeros()));
        assert_eq!(rejected.map_err(|r| r.session), Err(2));

        assert!(worker.wait_result(Duration::from_secs(5)).is_some());
        assert!(worker.submit(sphere_request(2, 1.0, Vector3::zeros())).is_ok());
    }

    #[test]
    fn idle_worker_has_no_result() {
        let mut worker = FitWorker::spawn();
        assert!(worker.try_result().is_none());
        assert!(worker.wait_result(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn submit_after_shutdown_returns_the_request() {
        let mut worker = FitWorker::spawn();
        worker.shutdown();
        assert!(worker.submit(sphere_request(1, 1.0, Vector3::zeros())).is_err());
    }
}
