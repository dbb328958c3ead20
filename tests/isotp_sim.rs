use std::time::Duration;

use ecu_transport::{
    Completion, ErrorFlags, InboundTransfer, SessionState, Target, TransportEngine, TransportError,
    channel::{CanFrame, Direction},
    config::{FlowControlParams, FrameLength, Padding, Role},
    session::{AddressingMode, TransferId},
    simulation::Simulation,
};

const TESTER: usize = 0;
const ECU: usize = 1;
const NODE: u16 = 1;

fn ms(x: u64) -> Duration {
    Duration::from_millis(x)
}

fn setup(tester: Target, ecu: Target) -> Simulation<TransportEngine> {
    let _ = env_logger::try_init();
    let mut sim = Simulation::new(ms(1));
    sim.attach(|port| {
        let mut e = TransportEngine::new(port);
        e.add_node(NODE, tester).expect("Tester config rejected");
        e
    });
    sim.attach(|port| {
        let mut e = TransportEngine::new(port);
        e.add_node(
            NODE,
            Target {
                role: Role::Ecu,
                ..ecu
            },
        )
        .expect("ECU config rejected");
        e
    });
    sim
}

fn target(bs: u8, st_min: u8, padding: Padding, frame_length: FrameLength) -> Target {
    Target {
        flow_control: FlowControlParams {
            block_size: bs,
            st_min,
            ..FlowControlParams::default()
        },
        padding,
        frame_length,
        ..Target::default()
    }
}

fn finished(sim: &Simulation<TransportEngine>, from: usize, id: TransferId) -> bool {
    !matches!(sim.node(from).status(id), Ok(SessionState::Unfinished))
}

/// Sends `payload` from one side and returns how the transfer ended, plus what the other
/// side received
fn transfer(
    sim: &mut Simulation<TransportEngine>,
    from: usize,
    to: usize,
    payload: &[u8],
) -> (Completion, Option<InboundTransfer>) {
    let id = sim
        .node_mut(from)
        .send_diagnostic_request(NODE, payload)
        .expect("Send rejected");
    assert!(
        sim.run_until(Duration::from_secs(10), |s| finished(s, from, id)),
        "Transfer never finished"
    );
    let completion = sim
        .node_mut(from)
        .poll_completion(id)
        .unwrap()
        .expect("No completion");
    let inbound = sim.node_mut(to).take_inbound(NODE).unwrap();
    (completion, inbound)
}

#[test]
fn test_single_frame() {
    let t = Target::default();
    let mut sim = setup(t, t);
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &[0x01, 0x02, 0x03, 0x04, 0x05]);
    assert_eq!(c, Completion::SendComplete);
    let rx = rx.expect("ECU received nothing");
    assert_eq!(rx.payload, vec![0x01, 0x02, 0x03, 0x04, 0x05]);
    assert_eq!(rx.addressing, AddressingMode::Physical);
    assert_eq!(
        sim.frames_on(0x7E0)[0].data(),
        &[0x05, 0x01, 0x02, 0x03, 0x04, 0x05, 0xCC, 0xCC]
    );
}

#[test]
fn test_multi_frame() {
    let t = target(8, 20, Padding::Pad(0xCC), FrameLength::CLASSIC);
    let mut sim = setup(t, t);
    let tx_bytes = (0..0xFF).collect::<Vec<u8>>();
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &tx_bytes);
    assert_eq!(c, Completion::SendComplete);
    assert_eq!(rx.unwrap().payload, tx_bytes);

    // And back again
    let tx2_bytes = (0x00..0xFF).rev().collect::<Vec<u8>>();
    let (c, rx) = transfer(&mut sim, ECU, TESTER, &tx2_bytes);
    assert_eq!(c, Completion::SendComplete);
    assert_eq!(rx.unwrap().payload, tx2_bytes);
    assert!(!sim.frames_on(0x7E8).is_empty());
}

#[test]
fn test_sequence_numbers_wrap() {
    let t = target(0, 0, Padding::Pad(0xAA), FrameLength::CLASSIC);
    let mut sim = setup(t, t);
    // FF + 36 CFs
    let tx_bytes = (0..0xFF).collect::<Vec<u8>>();
    transfer(&mut sim, TESTER, ECU, &tx_bytes);
    let sns: Vec<u8> = sim
        .frames_on(0x7E0)
        .iter()
        .filter(|f| f.data()[0] & 0xF0 == 0x20)
        .map(|f| f.data()[0] & 0x0F)
        .collect();
    assert_eq!(sns.len(), 36);
    let expected: Vec<u8> = (1..=36).map(|x| (x % 16) as u8).collect();
    assert_eq!(sns, expected);
    // Block size 0, so only one flow control
    assert_eq!(sim.frames_on(0x7E8).len(), 1);
}

#[test]
fn test_block_size_and_st_min() {
    let t = target(4, 10, Padding::Pad(0xCC), FrameLength::CLASSIC);
    let mut sim = setup(t, t);
    let tx_bytes = vec![0x42; 6 + 12 * 7];
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &tx_bytes);
    assert_eq!(c, Completion::SendComplete);
    assert_eq!(rx.unwrap().payload, tx_bytes);
    // 12 CFs in blocks of 4: the initial FC, then one after the 4th and 8th
    assert_eq!(sim.frames_on(0x7E8).len(), 3);

    let cf_times: Vec<Duration> = sim
        .history()
        .iter()
        .filter(|(_, f)| f.id() == 0x7E0 && f.data()[0] & 0xF0 == 0x20)
        .map(|(t, _)| *t)
        .collect();
    // Frames within a block keep STmin apart, a new block starts right after its flow control
    for pair in cf_times.windows(2) {
        assert!(pair[1] == pair[0] || pair[1] - pair[0] >= ms(10));
    }
    assert!(*cf_times.last().unwrap() >= ms(80));
}

#[test]
fn test_unpadded_frames() {
    let t = target(8, 0, Padding::NoPad, FrameLength::CLASSIC);
    let mut sim = setup(t, t);
    let tx_bytes: Vec<u8> = (0xD0..0xDA).collect();
    let (c, _) = transfer(&mut sim, TESTER, ECU, &tx_bytes);
    assert_eq!(c, Completion::SendComplete);
    let frames = sim.frames_on(0x7E0);
    assert_eq!(frames[0].data(), &[0x10, 0x0A, 0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5]);
    assert_eq!(frames[1].data(), &[0x21, 0xD6, 0xD7, 0xD8, 0xD9]);
    assert_eq!(sim.frames_on(0x7E8)[0].data(), &[0x30, 0x08, 0x00]);
}

#[test]
fn test_can_fd_transfer() {
    let t = Target {
        max_rx_payload: 8192,
        ..target(0, 0, Padding::Pad(0x00), FrameLength::FD_64)
    };
    let mut sim = setup(t, t);
    let tx_bytes: Vec<u8> = (0..5000).map(|x| (x % 251) as u8).collect();
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &tx_bytes);
    assert_eq!(c, Completion::SendComplete);
    assert_eq!(rx.unwrap().payload, tx_bytes);
    let frames = sim.frames_on(0x7E0);
    // 32 bit length escape in the first frame
    assert_eq!(&frames[0].data()[..6], &[0x10, 0x00, 0x00, 0x00, 0x13, 0x88]);
    assert!(frames.iter().all(|f| f.len() <= 64));
}

#[test]
fn test_functional_request() {
    let t = Target::default();
    let mut sim = setup(t, t);
    sim.node_mut(TESTER)
        .send_functional_request(NODE, &[0x3E, 0x80])
        .unwrap();
    sim.advance(ms(5));
    let rx = sim.node_mut(ECU).take_inbound(NODE).unwrap().unwrap();
    assert_eq!(rx.addressing, AddressingMode::Functional);
    assert_eq!(rx.payload, vec![0x3E, 0x80]);
    assert_eq!(sim.frames_on(0x7DF).len(), 1);
}

#[test]
fn test_no_echo_times_out() {
    let t = Target::default();
    let mut sim = setup(t, t);
    sim.set_echo(TESTER, false);
    let id = sim
        .node_mut(TESTER)
        .send_diagnostic_request(NODE, &[0x22; 20])
        .unwrap();
    sim.advance(ms(1500));
    assert_eq!(
        sim.node_mut(TESTER).poll_completion(id).unwrap(),
        Some(Completion::Failed(ErrorFlags::SEND_TIMEOUT))
    );
    // Only the first frame ever went out
    assert_eq!(sim.frames_on(0x7E0).len(), 1);
}

#[test]
fn test_missing_flow_control_times_out() {
    let t = Target::default();
    let mut sim = setup(t, t);
    sim.set_muted(ECU, true);
    let id = sim
        .node_mut(TESTER)
        .send_diagnostic_request(NODE, &[0x22; 20])
        .unwrap();
    sim.advance(ms(1005));
    assert_eq!(sim.node(TESTER).status(id).unwrap(), SessionState::Unfinished);
    sim.advance(ms(10));
    assert_eq!(
        sim.node_mut(TESTER).poll_completion(id).unwrap(),
        Some(Completion::Failed(ErrorFlags::BS_TIMEOUT))
    );
}

#[test]
fn test_overflow_rejects_transfer() {
    let tester = Target::default();
    let ecu = Target {
        max_rx_payload: 64,
        ..Target::default()
    };
    let mut sim = setup(tester, ecu);
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &[0x36; 100]);
    assert_eq!(c, Completion::Failed(ErrorFlags::OVERFLOW));
    assert!(rx.is_none());
    assert_eq!(sim.frames_on(0x7E0).len(), 1);
}

#[test]
fn test_out_of_sequence_from_external_tester() {
    let t = Target::default();
    let mut sim = setup(t, t);
    let ff = CanFrame::new(0x7E0, &[0x10, 0x14, 1, 2, 3, 4, 5, 6]).with_direction(Direction::Rx);
    sim.inject(ff);
    sim.advance(ms(2));
    // ECU answered with CTS
    assert_eq!(sim.frames_on(0x7E8)[0].data()[0], 0x30);
    sim.inject(CanFrame::new(0x7E0, &[0x22, 7, 8, 9, 10, 11, 12, 13]));
    sim.inject(CanFrame::new(0x7E0, &[0x21, 7, 8, 9, 10, 11, 12, 13]));
    sim.inject(CanFrame::new(0x7E0, &[0x22, 14, 15, 16, 17, 18, 19, 20]));
    sim.advance(ms(2));
    // The reception fails on the first frame out of order, the rest are ignored
    assert!(matches!(
        sim.node_mut(ECU).take_inbound(NODE),
        Err(TransportError::InboundFailed { id, errors })
            if id == TransferId::new(NODE, 1) && errors == ErrorFlags::FLOW_CONTROL_ERROR
    ));
    assert_eq!(sim.node_mut(ECU).take_inbound(NODE).unwrap(), None);
    assert_eq!(sim.frames_on(0x7E8).len(), 1);
}

#[test]
fn test_back_to_back_sends() {
    let t = Target::default();
    let mut sim = setup(t, t);
    let a = sim
        .node_mut(TESTER)
        .send_diagnostic_request(NODE, &[0xAA; 20])
        .unwrap();
    assert!(matches!(
        sim.node_mut(TESTER).send_diagnostic_request(NODE, &[0xBB; 20]),
        Err(TransportError::NodeBusy { active, .. }) if active == a
    ));
    assert!(sim.run_until(Duration::from_secs(3), |s| finished(s, TESTER, a)));
    assert_eq!(
        sim.node_mut(TESTER).poll_completion(a).unwrap(),
        Some(Completion::SendComplete)
    );

    let first = sim.node_mut(ECU).take_inbound(NODE).unwrap().unwrap();
    assert_eq!(first.payload, vec![0xAA; 20]);

    // Once the first is done, the next one goes out on its own
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &[0xBB; 20]);
    assert_eq!(c, Completion::SendComplete);
    assert_eq!(rx.unwrap().payload, vec![0xBB; 20]);
    let first_frames: Vec<u8> = sim
        .frames_on(0x7E0)
        .iter()
        .filter(|f| f.data()[0] & 0xF0 == 0x10)
        .map(|f| f.data()[2])
        .collect();
    assert_eq!(first_frames, vec![0xAA, 0xBB]);
}

#[test]
fn test_await_response() {
    let tester = Target {
        await_response: true,
        ..Target::default()
    };
    let mut sim = setup(tester, Target::default());
    let id = sim
        .node_mut(TESTER)
        .send_diagnostic_request(NODE, &[0x22, 0xF1, 0x90])
        .unwrap();
    sim.advance(ms(5));
    assert_eq!(sim.node(TESTER).status(id).unwrap(), SessionState::Unfinished);

    let req = sim.node_mut(ECU).take_inbound(NODE).unwrap().unwrap();
    assert_eq!(req.payload, vec![0x22, 0xF1, 0x90]);
    let mut resp = vec![0x62, 0xF1, 0x90];
    resp.extend_from_slice(b"WDD2221761A000001");
    sim.node_mut(ECU).send_diagnostic_request(NODE, &resp).unwrap();

    let mut received = None;
    assert!(sim.run_until(Duration::from_secs(2), |s| {
        if received.is_none() {
            received = s.node_mut(TESTER).take_inbound(NODE).unwrap();
        }
        received.is_some()
    }));
    assert_eq!(received.unwrap().payload, resp);
    assert_eq!(
        sim.node_mut(TESTER).poll_completion(id).unwrap(),
        Some(Completion::SendComplete)
    );

    // ECU stays silent this time
    let id = sim
        .node_mut(TESTER)
        .send_diagnostic_request(NODE, &[0x22, 0xF1, 0x91])
        .unwrap();
    sim.advance(ms(500));
    assert_eq!(
        sim.node_mut(TESTER).poll_completion(id).unwrap(),
        Some(Completion::Failed(ErrorFlags::RESPONSE_TIMEOUT))
    );
}

#[test]
fn test_reconfigured_addresses() {
    let t = Target::default();
    let mut sim = setup(t, t);
    for node in [TESTER, ECU] {
        sim.node_mut(node)
            .configure_target(NODE, 0x7E1, 0x7DF, 0x7E9)
            .unwrap();
    }
    let (c, rx) = transfer(&mut sim, TESTER, ECU, &[0x11; 30]);
    assert_eq!(c, Completion::SendComplete);
    assert_eq!(rx.unwrap().payload, vec![0x11; 30]);
    assert!(sim.frames_on(0x7E0).is_empty());
    assert_eq!(sim.frames_on(0x7E9).len(), 1);
}
