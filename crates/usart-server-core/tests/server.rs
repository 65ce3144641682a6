//! End-to-end tests of the Server thread against the simulated driver

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::{Duration, Instant};

    use usart_server_core::driver::sim::{SimAux, SimCall, SimHandle, SimProfile, SimulatedUsart};
    use usart_server_core::driver::{AbortKind, DriverError, ModemControl, ModemStatus};
    use usart_server_core::server::{
        detect_capabilities, RunState, Server, ServerConfig, ServerError,
    };
    use usart_server_core::VERSION;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> ServerConfig {
        ServerConfig {
            buffer_size: 256,
            command_timeout_ms: 30,
            xfer_timeout_ms: 50,
            response_delay_ms: 0,
            capability_delay_ms: 0,
            stop_retries: 200,
            stop_poll_ms: 5,
            ..ServerConfig::default()
        }
    }

    fn start() -> (Server, SimHandle, SimAux) {
        start_with(config())
    }

    fn start_with(config: ServerConfig) -> (Server, SimHandle, SimAux) {
        let sim = SimulatedUsart::default();
        let handle = sim.handle();
        let aux = SimAux::new();
        let server = Server::start(sim, aux.clone(), config).unwrap();
        (server, handle, aux)
    }

    /// Send `command` and wait for the first call matching `pred`, returning
    /// how long after sending it was observed
    fn time_until_call<F>(handle: &SimHandle, command: &str, pred: F) -> Duration
    where
        F: Fn(&SimCall) -> bool,
    {
        handle.clear_calls();
        let sent = Instant::now();
        handle.send_command(command);
        assert!(handle.wait_for_call(WAIT, pred), "no call after {:?}", command);
        sent.elapsed()
    }

    /// Send a command and collect a reply of `len` bytes
    fn exchange(handle: &SimHandle, command: &str, len: usize) -> Vec<u8> {
        handle.send_command(command);
        handle
            .wait_outbound(len, WAIT)
            .unwrap_or_else(|| panic!("no reply to {:?}", command))
    }

    fn padded(text: &str, slot: usize) -> Vec<u8> {
        let mut out = text.as_bytes().to_vec();
        out.resize(slot, 0);
        out
    }

    fn wait_for_state(server: &Server, state: RunState) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if server.run_state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Wait until the Server has consumed every queued byte and gone back
    /// to waiting for the next command
    fn settle(server: &Server, handle: &SimHandle) {
        let deadline = Instant::now() + WAIT;
        while handle.inbound_len() != 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(wait_for_state(server, RunState::Receiving));
    }

    #[test]
    fn test_get_version_reply_slot() {
        let (server, handle, _aux) = start();
        assert_eq!(exchange(&handle, "GET VER", 16), padded(VERSION, 16));
        assert!(wait_for_state(&server, RunState::Receiving));
        server.stop().unwrap();
    }

    #[test]
    fn test_get_capabilities_record() {
        let (server, handle, _aux) = start();
        assert_eq!(
            exchange(&handle, "GET CAP", 32),
            padded("1B,1C,7,3,F,33,9600,2000000", 32)
        );
        server.stop().unwrap();
    }

    #[test]
    fn test_buffer_load_and_readback() {
        let (server, handle, _aux) = start();
        handle.send_command("SET BUF RX,8,AA");
        handle.push_inbound(b"ABCDEFGH");
        settle(&server, &handle);

        // Bytes past the loaded length keep the fill pattern
        let reply = exchange(&handle, "GET BUF RX,10", 10);
        assert_eq!(reply, b"ABCDEFGH\xAA\xAA".to_vec());
        server.stop().unwrap();
    }

    #[test]
    fn test_zero_length_buffer_fill_has_no_data_phase() {
        let (server, handle, _aux) = start();
        handle.send_command("SET BUF TX,0,5A");
        settle(&server, &handle);
        assert!(!handle.calls().contains(&SimCall::Receive(0)));

        assert_eq!(exchange(&handle, "GET BUF TX,4", 4), vec![0x5A; 4]);
        server.stop().unwrap();
    }

    #[test]
    fn test_send_transfer_updates_count() {
        let (server, handle, _aux) = start();
        handle.send_command("SET BUF TX,0,33");
        settle(&server, &handle);

        assert_eq!(exchange(&handle, "XFER 0,16", 16), vec![0x33; 16]);
        assert_eq!(exchange(&handle, "GET CNT", 16), padded("16", 16));
        server.stop().unwrap();
    }

    #[test]
    fn test_receive_transfer_fills_rx_buffer() {
        let (server, handle, _aux) = start();
        handle.send_command("XFER 1,4");
        handle.push_inbound(b"wxyz");
        settle(&server, &handle);

        assert_eq!(exchange(&handle, "GET CNT", 16), padded("4", 16));
        assert_eq!(exchange(&handle, "GET BUF RX,4", 4), b"wxyz".to_vec());
        server.stop().unwrap();
    }

    #[test]
    fn test_stalled_transfer_is_aborted_and_count_kept() {
        let (server, handle, _aux) = start();
        handle.set_stall_transfers(true);
        handle.send_command("XFER 2,100,0,100");
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Abort(AbortKind::Transfer)));
        handle.set_stall_transfers(false);
        assert!(wait_for_state(&server, RunState::Receiving));

        assert_eq!(exchange(&handle, "GET CNT", 16), padded("0", 16));
        server.stop().unwrap();
    }

    #[test]
    fn test_break_flag_read_and_cleared() {
        let (server, handle, _aux) = start();
        handle.send_command("SET BRK 0,5");
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Break(false)));
        assert!(!handle.break_active());

        assert_eq!(exchange(&handle, "GET BRK", 1), b"1".to_vec());
        assert_eq!(exchange(&handle, "GET BRK", 1), b"0".to_vec());
        server.stop().unwrap();
    }

    #[test]
    fn test_modem_status_encoding() {
        let (server, handle, _aux) = start();
        for (cts, dsr, expected) in [
            (false, false, b'0'),
            (true, false, b'1'),
            (false, true, b'2'),
            (true, true, b'3'),
        ] {
            handle.set_modem_status(ModemStatus {
                cts,
                dsr,
                ..ModemStatus::default()
            });
            assert_eq!(exchange(&handle, "GET MDM", 1), vec![expected]);
        }
        server.stop().unwrap();
    }

    #[test]
    fn test_modem_pulse_releases_lines() {
        let (server, handle, aux) = start();
        handle.send_command("SET MDM D,0,5");
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Modem(ModemControl::RtsSet)));
        settle(&server, &handle);

        assert_eq!(handle.modem_outputs(), (false, false));
        let state = aux.state();
        assert!(!state.dcd && !state.ri);
        assert!(state.history.contains(&("DCD", true)));
        assert!(state.history.contains(&("RI", true)));
        server.stop().unwrap();
    }

    #[test]
    fn test_garbage_and_partial_commands_are_dropped() {
        let (server, handle, _aux) = start();
        handle.send_command("HELLO WORLD");
        settle(&server, &handle);

        handle.push_inbound(b"GET V");
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Abort(AbortKind::Receive)));
        assert!(wait_for_state(&server, RunState::Receiving));
        assert!(handle.take_outbound().is_empty());

        assert_eq!(exchange(&handle, "GET VER", 16), padded(VERSION, 16));
        server.stop().unwrap();
    }

    #[test]
    fn test_transfer_settings_apply_only_to_transfer() {
        let (server, handle, _aux) = start();
        handle.send_command("SET COM 1,7,1,0,0,0,0,9600");
        settle(&server, &handle);
        handle.clear_calls();

        handle.send_command("SET BUF TX,0,11");
        settle(&server, &handle);
        assert_eq!(exchange(&handle, "XFER 0,2", 2), vec![0x11; 2]);
        settle(&server, &handle);

        let configured: Vec<u32> = handle
            .calls()
            .iter()
            .filter_map(|c| match c {
                SimCall::Configure { config, .. } => Some(config.baud_rate),
                _ => None,
            })
            .collect();
        assert_eq!(configured, vec![9_600, 115_200]);
        assert_eq!(handle.current_config().map(|c| c.baud_rate), Some(115_200));
        server.stop().unwrap();
    }

    #[test]
    fn test_stop_while_waiting_for_command() {
        let (server, handle, aux) = start();
        assert!(server.is_running());
        server.stop().unwrap();

        let calls = handle.calls();
        let power_off = calls.iter().position(|c| *c == SimCall::Power(false));
        let uninit = calls.iter().position(|c| *c == SimCall::Uninitialize);
        assert!(power_off.is_some());
        assert!(power_off < uninit);
        assert_eq!(
            calls.iter().filter(|c| **c == SimCall::Uninitialize).count(),
            1
        );
        assert_eq!(aux.state().history, Vec::new());
    }

    #[test]
    fn test_drop_stops_server() {
        let (server, handle, _aux) = start();
        drop(server);
        assert!(handle.calls().contains(&SimCall::Uninitialize));
    }

    #[test]
    fn test_rejected_default_configuration_fails_start() {
        let profile = SimProfile {
            max_baud: 57_600,
            ..SimProfile::default()
        };
        let sim = SimulatedUsart::new(profile);
        let handle = sim.handle();
        let result = Server::start(sim, SimAux::new(), config());
        assert!(matches!(
            result,
            Err(ServerError::Driver(DriverError::Unsupported))
        ));
        assert!(handle.calls().contains(&SimCall::Uninitialize));
    }

    #[test]
    fn test_buffer_allocation_failure_leaves_driver_untouched() {
        let sim = SimulatedUsart::default();
        let handle = sim.handle();
        let config = ServerConfig {
            buffer_size: usize::MAX,
            ..config()
        };
        let result = Server::start(sim, SimAux::new(), config);
        assert!(matches!(result, Err(ServerError::Allocation { .. })));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_detect_capabilities_releases_driver() {
        let sim = SimulatedUsart::default();
        let handle = sim.handle();
        let snapshot = detect_capabilities(sim, SimAux::absent(), &config()).unwrap();
        assert_eq!(snapshot.to_record(), "1B,1C,7,3,F,3,9600,2000000");
        assert_eq!(handle.calls().last(), Some(&SimCall::Uninitialize));
    }

    #[test]
    fn test_transfer_delay_precedes_configuration() {
        let (server, handle, _aux) = start();
        let elapsed = time_until_call(&handle, "XFER 0,2,30", |c| {
            matches!(c, SimCall::Configure { .. })
        });
        assert!(elapsed >= Duration::from_millis(30), "configured after {:?}", elapsed);
        assert_eq!(handle.wait_outbound(2, WAIT), Some(vec![0; 2]));
        server.stop().unwrap();
    }

    #[test]
    fn test_break_asserted_after_delay() {
        let (server, handle, _aux) = start();
        let elapsed = time_until_call(&handle, "SET BRK 20,0", |c| *c == SimCall::Break(true));
        assert!(elapsed >= Duration::from_millis(20), "break after {:?}", elapsed);
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Break(false)));
        server.stop().unwrap();
    }

    #[test]
    fn test_modem_lines_asserted_after_delay() {
        let (server, handle, _aux) = start();
        let elapsed = time_until_call(&handle, "SET MDM 1,20,0", |c| {
            *c == SimCall::Modem(ModemControl::RtsSet)
        });
        assert!(elapsed >= Duration::from_millis(20), "RTS set after {:?}", elapsed);

        let calls = handle.calls();
        let clear = calls
            .iter()
            .position(|c| *c == SimCall::Modem(ModemControl::RtsClear));
        let set = calls
            .iter()
            .position(|c| *c == SimCall::Modem(ModemControl::RtsSet));
        assert!(clear.is_some() && clear < set);
        server.stop().unwrap();
    }

    #[test]
    fn test_stop_timeout_still_releases_driver() {
        let (server, handle, _aux) = start_with(ServerConfig {
            stop_retries: 1,
            stop_poll_ms: 1,
            ..config()
        });
        handle.send_command("SET BRK 0,200");
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Break(true)));

        assert!(matches!(
            server.stop(),
            Err(ServerError::StopTimeout { attempts: 1 })
        ));
        assert!(handle.wait_for_call(WAIT, |c| *c == SimCall::Uninitialize));
        assert!(handle.calls().contains(&SimCall::Power(false)));
    }
}
