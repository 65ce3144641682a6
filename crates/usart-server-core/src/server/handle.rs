//! Server lifecycle

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::driver::{event_channel, AuxSignals, CommConfig, UsartDriver};

use super::buffer::AlignedBuffer;
use super::context::ServerContext;
use super::error::ServerError;
use super::probe::{probe, CapabilitySnapshot};
use super::state::{RunState, SharedRunState};
use super::transport::Transport;
use super::ServerConfig;

/// Initialize and power the driver, then apply the command-exchange configuration
fn bring_up<D>(
    mut driver: D,
    config: &ServerConfig,
    run_state: SharedRunState,
) -> Result<Transport, ServerError>
where
    D: UsartDriver + 'static,
{
    let (events_tx, events_rx) = event_channel();
    driver.initialize(events_tx)?;
    if let Err(e) = driver.power(true) {
        let _ = driver.uninitialize();
        return Err(e.into());
    }

    let mut transport = Transport::new(
        Box::new(driver),
        events_rx,
        config.command_timeout(),
        run_state,
    );
    if let Err(e) = transport.configure(&CommConfig::command_exchange(config.mode)) {
        let _ = transport.close();
        return Err(e.into());
    }
    Ok(transport)
}

/// Bring the driver up, probe its capabilities and release it again
pub fn detect_capabilities<D, A>(
    driver: D,
    mut aux: A,
    config: &ServerConfig,
) -> Result<CapabilitySnapshot, ServerError>
where
    D: UsartDriver + 'static,
    A: AuxSignals,
{
    let mut transport = bring_up(driver, config, SharedRunState::default())?;
    let aux_lines = aux.initialize();
    let snapshot = probe(
        &mut transport,
        aux_lines,
        &CommConfig::command_exchange(config.mode),
    );
    aux.uninitialize();
    transport.close()?;
    Ok(snapshot)
}

/// Handle to a running Server thread
pub struct Server {
    run_state: SharedRunState,
    thread: Option<JoinHandle<()>>,
    config: ServerConfig,
}

impl Server {
    /// Allocate buffers, bring up the driver, probe capabilities and spawn
    /// the Server thread
    pub fn start<D, A>(driver: D, mut aux: A, config: ServerConfig) -> Result<Self, ServerError>
    where
        D: UsartDriver + 'static,
        A: AuxSignals + 'static,
    {
        let rx_buf = AlignedBuffer::new(config.buffer_size)?;
        let tx_buf = AlignedBuffer::new(config.buffer_size)?;

        let run_state = SharedRunState::default();
        let transport = bring_up(driver, &config, run_state.clone())?;
        let aux_lines = aux.initialize();

        let mut context = ServerContext::new(
            config.clone(),
            transport,
            Box::new(aux),
            aux_lines,
            run_state.clone(),
            (rx_buf, tx_buf),
        );
        let snapshot = context.probe_capabilities();
        info!("Capabilities: {}", snapshot.to_record());

        // Handed over only once the thread exists; the thread releases the
        // driver on exit.
        let (handoff, inbox) = mpsc::sync_channel::<ServerContext>(1);
        let spawned = thread::Builder::new()
            .name("usart-server".to_string())
            .spawn(move || {
                if let Ok(context) = inbox.recv() {
                    context.run().shutdown();
                }
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                context.shutdown();
                return Err(e.into());
            }
        };
        if let Err(mpsc::SendError(context)) = handoff.send(context) {
            context.shutdown();
            let _ = thread.join();
            return Err(ServerError::ThreadPanicked);
        }

        Ok(Self {
            run_state,
            thread: Some(thread),
            config,
        })
    }

    /// Current state of the run loop
    pub fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    /// Whether the Server thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Request termination and wait for the thread to exit. The thread powers
    /// down and releases the driver before it finishes.
    pub fn stop(mut self) -> Result<(), ServerError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), ServerError> {
        let thread = self.thread.take().ok_or(ServerError::NotRunning)?;
        self.run_state.request_stop();

        for _ in 0..self.config.stop_retries {
            if thread.is_finished() {
                return thread.join().map_err(|_| ServerError::ThreadPanicked);
            }
            thread::sleep(self.config.stop_poll());
        }

        error!(
            "Server thread still running after {} polls, driver is released when it exits",
            self.config.stop_retries
        );
        Err(ServerError::StopTimeout {
            attempts: self.config.stop_retries,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("Server stop on drop failed: {}", e);
            }
        }
    }
}
