use anyhow::{Result, bail};
use imucal_core::{ParameterStore, RawSample, RefitMode};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod config;
pub mod fit_worker;
pub mod processor;
pub mod replay;
pub mod storage;

pub use config::{AccelAxes, ConfigError, ImuCalConfig};
pub use fit_worker::FitWorker;
pub use processor::{
    CalibratedOutput, CalibrationDiagnostics, Command, CommandAck, DiagnosticLevel, FusedImu,
    SampleProcessor, StampedVector,
};
pub use storage::JsonFileStore;

/// Opens the store a [`SampleProcessor`] loads from and saves to.
type StoreFactory = Box<dyn Fn() -> Box<dyn ParameterStore + Send> + Send>;

/// Everything the service loop consumes, in arrival order.
#[derive(Debug, Clone)]
enum Event {
    Sample(RawSample),
    /// Tagged so the acknowledgement can be matched to the call that sent it.
    Command(u64, Command),
    Refit,
    /// Answered once every earlier event has been handled.
    Sync(Sender<()>),
}

/// Runs a [`SampleProcessor`] on a background thread.
///
/// Samples and commands share one queue, so they are handled strictly in the
/// order they were submitted and never concurrently.
///
/// # Example:
///
/// ```no_run
/// use imucal_rust::{CalibrationService, ImuCalConfig};
/// use std::time::Duration;
///
/// fn main() -> anyhow::Result<()> {
///     let config = ImuCalConfig::load("imucal.toml".as_ref())?;
///     let mut service = CalibrationService::from_config(&config)?;
///     service.start();
///     service.start_calibration(Duration::from_secs(1))?;
///
///     loop {
///         // service.submit_sample(sample)?;
///         while let Ok(outputs) = service.get_outputs(Some(Duration::from_millis(100))) {
///             println!("{:#?}", outputs);
///         }
///     }
/// }
/// ```
pub struct CalibrationService {
    output_receiver: Receiver<CalibratedOutput>,
    diagnostics_receiver: Receiver<CalibrationDiagnostics>,
    ack_receiver: Receiver<(u64, CommandAck)>,
    error_receiver: Receiver<String>,
    running: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<SampleProcessor>>,
    output_sender: Sender<CalibratedOutput>,
    diagnostics_sender: Sender<CalibrationDiagnostics>,
    ack_sender: Sender<(u64, CommandAck)>,
    error_sender: Sender<String>,
    event_sender: Sender<Event>,
    event_receiver: Option<Receiver<Event>>,
    processor: Option<SampleProcessor>,

    ack_buffer: VecDeque<(u64, CommandAck)>,
    next_command_id: u64,

    config: ImuCalConfig,
    open_store: StoreFactory,
}

impl CalibrationService {
    /// Creates a service storing its calibration at
    /// `<storage.directory>/<rover>_calibration_alt.json`.
    pub fn from_config(config: &ImuCalConfig) -> Result<Self> {
        if config.rover.is_empty() {
            bail!("a rover name is required to locate the calibration record");
        }
        let directory = config.storage.directory.clone();
        let rover = config.rover.clone();
        Ok(Self::new(config, move || {
            Box::new(JsonFileStore::new(&directory, &rover))
        }))
    }

    /// Creates a stopped service. Stored parameters are loaded here from the
    /// store `open_store` returns.
    pub fn new(
        config: &ImuCalConfig,
        open_store: impl Fn() -> Box<dyn ParameterStore + Send> + Send + 'static,
    ) -> Self {
        let (output_sender, output_receiver) = channel();
        let (diagnostics_sender, diagnostics_receiver) = channel();
        let (ack_sender, ack_receiver) = channel();
        let (error_sender, error_receiver) = channel();
        let (event_sender, event_receiver) = channel();

        Self {
            output_receiver,
            diagnostics_receiver,
            ack_receiver,
            error_receiver,
            running: Arc::new(AtomicBool::new(false)),
            join_handle: None,
            output_sender,
            diagnostics_sender,
            ack_sender,
            error_sender,
            event_sender,
            event_receiver: Some(event_receiver),
            processor: Some(SampleProcessor::new(config, open_store())),
            ack_buffer: VecDeque::new(),
            next_command_id: 0,
            config: config.clone(),
            open_store: Box::new(open_store),
        }
    }

    /// Starts the background thread that drains the event queue.
    pub fn start(&mut self) {
        if self.join_handle.is_some() {
            return;
        }

        let mut processor = match self.processor.take() {
            Some(p) => p,
            None => return,
        };

        let event_receiver = match self.event_receiver.take() {
            Some(r) => r,
            None => return,
        };

        self.running.store(true, Ordering::Relaxed);
        let running_clone = self.running.clone();
        let output_sender = self.output_sender.clone();
        let diagnostics_sender = self.diagnostics_sender.clone();
        let ack_sender = self.ack_sender.clone();
        let error_sender = self.error_sender.clone();
        let queue_timeout = self.config.queue_timeout();
        let background = self.config.calibration.refit_mode == RefitMode::Background;

        let handle: JoinHandle<SampleProcessor> = thread::spawn(move || {
            let mut worker = background.then(FitWorker::spawn);

            while running_clone.load(Ordering::Relaxed) {
                // Finished fits go in before the next event so every output
                // uses the parameters current when it was processed.
                if let Some(worker) = worker.as_mut()
                    && let Some(result) = worker.try_result()
                {
                    processor.install_fit(result);
                }

                match event_receiver.recv_timeout(queue_timeout) {
                    Ok(Event::Sample(sample)) => match processor.process(&sample) {
                        Ok(processed) => {
                            if let Some(diagnostics) = processed.diagnostics {
                                let _ = diagnostics_sender.send(diagnostics);
                            }
                            if let Some(output) = processed.output
                                && output_sender.send(output).is_err()
                            {
                                break; // Receiver dropped
                            }
                        }
                        Err(e) => {
                            let _ = error_sender.send(e.to_string());
                        }
                    },
                    Ok(Event::Command(id, command)) => {
                        let ack = processor.handle_command(command);
                        if !ack.success {
                            let _ = error_sender.send(ack.message.clone());
                        }
                        if ack_sender.send((id, ack)).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Refit) => {
                        if processor.refit().is_none() {
                            debug!("Refit requested with nothing to fit");
                        }
                    }
                    Ok(Event::Sync(reply)) => {
                        let _ = reply.send(());
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if let Some(worker) = worker.as_mut()
                    && !worker.is_busy()
                    && let Some(request) = processor.take_fit_request()
                    && worker.submit(request).is_err()
                {
                    warn!("Fit worker unavailable, dropping fit request");
                }
            }

            if let Some(mut worker) = worker {
                worker.shutdown();
            }
            processor
        });

        self.join_handle = Some(handle);
    }

    /// Stops the background thread and takes the processor back. Events still
    /// queued when the thread exits are dropped.
    ///
    /// If the thread panicked, its processor is lost; a new one is loaded from
    /// the store so the service can be started again.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(processor) => self.processor = Some(processor),
                Err(_) => {
                    warn!("Service thread panicked, reloading stored calibration");
                    let _ = self.error_sender.send("Service thread panicked".to_string());
                    self.processor = Some(SampleProcessor::new(&self.config, (self.open_store)()));
                }
            }
        }

        // The receiver was moved into the thread on start(); the queue it
        // held is lost with it, so remake the pair for a restart.
        if self.event_receiver.is_none() {
            let (new_sender, new_receiver) = channel();
            self.event_sender = new_sender;
            self.event_receiver = Some(new_receiver);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// The processor, available while the service is stopped.
    pub fn processor(&self) -> Option<&SampleProcessor> {
        self.processor.as_ref()
    }

    /// Queues one raw sample.
    pub fn submit_sample(&self, sample: RawSample) -> Result<()> {
        self.send_event(Event::Sample(sample))
    }

    /// Asks for a full-buffer refit now, regardless of the refit interval.
    pub fn request_refit(&self) -> Result<()> {
        self.send_event(Event::Refit)
    }

    /// Blocks until every event submitted before this call has been handled.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub fn sync(&self, timeout: Duration) -> Result<bool> {
        let (reply_sender, reply_receiver) = channel();
        self.send_event(Event::Sync(reply_sender))?;
        match reply_receiver.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                bail!("Service stopped before handling queued events")
            }
        }
    }

    /// Retrieves all available outputs, optionally blocking until at least one is available.
    pub fn get_outputs(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<CalibratedOutput>, RecvTimeoutError> {
        let mut outputs = Vec::new();

        if let Some(duration) = timeout {
            outputs.push(self.output_receiver.recv_timeout(duration)?);
        }

        while let Ok(output) = self.output_receiver.try_recv() {
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Retrieves all available diagnostics records, optionally blocking until
    /// at least one is available. Records are only produced while collecting.
    pub fn get_diagnostics(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<CalibrationDiagnostics>, RecvTimeoutError> {
        let mut records = Vec::new();

        if let Some(duration) = timeout {
            records.push(self.diagnostics_receiver.recv_timeout(duration)?);
        }

        while let Ok(record) = self.diagnostics_receiver.try_recv() {
            records.push(record);
        }
        Ok(records)
    }

    /// Sends `start-calibration` and waits for its acknowledgement.
    pub fn start_calibration(&mut self, timeout: Duration) -> Result<Option<CommandAck>> {
        self.run_command(Command::StartCalibration, timeout)
    }

    /// Sends `store-calibration` and waits for its acknowledgement.
    pub fn store_calibration(&mut self, timeout: Duration) -> Result<Option<CommandAck>> {
        self.run_command(Command::StoreCalibration, timeout)
    }

    /// Returns the oldest unread error message, if any.
    pub fn check_error(&self) -> Option<String> {
        self.error_receiver.try_recv().ok()
    }

    fn run_command(&mut self, command: Command, timeout: Duration) -> Result<Option<CommandAck>> {
        let id = self.next_command_id;
        self.next_command_id += 1;
        self.send_event(Event::Command(id, command))?;
        self.wait_for_ack(id, timeout)
    }

    fn send_event(&self, event: Event) -> Result<()> {
        self.event_sender
            .send(event)
            .map_err(|_| io::Error::other("Event channel closed"))?;
        Ok(())
    }

    /// Wait up to `timeout` for the acknowledgement of command `id`.
    ///
    /// Commands run in submission order, so once `id` is answered every
    /// buffered acknowledgement of an earlier command belongs to a call that
    /// already timed out and is discarded.
    fn wait_for_ack(&mut self, id: u64, timeout: Duration) -> Result<Option<CommandAck>> {
        while let Ok(ack) = self.ack_receiver.try_recv() {
            self.ack_buffer.push_back(ack);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(idx) = self.ack_buffer.iter().position(|(ack_id, _)| *ack_id == id) {
                let ack = self.ack_buffer.remove(idx).map(|(_, ack)| ack);
                let before = self.ack_buffer.len();
                self.ack_buffer.retain(|(ack_id, _)| *ack_id > id);
                let discarded = before - self.ack_buffer.len();
                if discarded > 0 {
                    debug!("Discarded {discarded} late acknowledgement(s)");
                }
                return Ok(ack);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            match self.ack_receiver.recv_timeout(deadline - now) {
                Ok(ack) => self.ack_buffer.push_back(ack),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::other("Acknowledgement channel closed").into());
                }
            }
        }
    }
}

/// Ensures that the service is properly stopped when dropped, i.e. .stop() is called.
impl Drop for CalibrationService {
    fn drop(&mut self) {
        self.stop();
    }
}
