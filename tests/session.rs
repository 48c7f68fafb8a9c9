use stcisp::{
    Error, Family, Flashing, PortConfig, ResetStrategy,
    constants::PACKET_MCU,
    flashing::FlashPlan,
    packet::{Checksum, Framing},
    protocol::{self, Link},
    transport::MockPort,
};

const F: Framing = Framing::STC89;

fn mcu(payload: &[u8]) -> Vec<u8> {
    let mut packet = F.encode(payload);
    packet[2] = PACKET_MCU;
    let at = packet.len() - 2;
    packet[at] = Checksum::Sum8.compute(&packet[2..at]) as u8;
    packet
}

/// STC89C52RC at 11.0592 MHz, 12T mode
fn status() -> Vec<u8> {
    let mut s = vec![0u8; 23];
    for i in 0..8 {
        s[1 + 2 * i..3 + 2 * i].copy_from_slice(&2688u16.to_be_bytes());
    }
    s[17] = 0x44;
    s[18] = b'C';
    s[19] = 0xfd;
    s[20..22].copy_from_slice(&0xf002u16.to_be_bytes());
    s
}

fn handshake_replies() -> Vec<Vec<u8>> {
    vec![mcu(&[0x8f]), mcu(&[0x8e]), mcu(&[0x80]), mcu(&[0x80]), mcu(&[0x80]), mcu(&[0x80])]
}

fn config() -> PortConfig {
    PortConfig {
        transfer_baud: 9600,
        ..PortConfig::default()
    }
}

#[test]
fn autodetected_stc89_is_programmed() {
    let image: Vec<u8> = vec![0x02; 100];
    let mut padded = image.clone();
    padded.resize(512, 0xff);

    let mut replies = vec![mcu(&status())];
    replies.extend(handshake_replies());
    replies.push(mcu(&[0x80]));
    for block in padded.chunks(128) {
        let csum = block.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        replies.push(mcu(&[0x80, csum]));
    }
    replies.push(mcu(&[0x8d]));

    let port = MockPort::new(replies);
    let state = port.state();
    let link = Link::new(port, config());
    let mut flashing = Flashing::new(protocol::open_serial(Family::Auto, link).unwrap());

    let info = flashing.connect(&ResetStrategy::Manual).unwrap();
    assert_eq!(info.model.name, "STC89C52RC");
    assert_eq!(flashing.protocol().family(), Family::Stc89);

    let plan = FlashPlan {
        code: Some(image),
        ..Default::default()
    };
    let mut last = None;
    let mut sink = |current: usize, _: usize, total: usize| last = Some((current, total));
    flashing.run(&plan, &mut sink).unwrap();
    assert_eq!(last, Some((512, 512)));

    let state = state.borrow();
    assert!(state.closed);
    let packets = state.packets();
    let reset = F.extract_payload(packets.last().unwrap()).unwrap();
    assert_eq!(reset, vec![0x82]);
    // handshake (6) + erase + 4 blocks + options + reset
    assert_eq!(packets.len(), 13);
}

#[test]
fn failed_erase_still_resets_the_target() {
    let mut replies = vec![mcu(&status())];
    replies.extend(handshake_replies());
    replies.push(mcu(&[0x81]));

    let port = MockPort::new(replies);
    let state = port.state();
    let link = Link::new(port, config());
    let mut flashing = Flashing::new(protocol::open_serial(Family::Stc89, link).unwrap());
    flashing.connect(&ResetStrategy::Manual).unwrap();

    let plan = FlashPlan {
        erase: true,
        ..Default::default()
    };
    let err = flashing.run(&plan, &mut stcisp::progress::NoProgress);
    assert!(matches!(err, Err(Error::Protocol(_))));
    let state = state.borrow();
    assert!(state.closed);
    assert_eq!(F.extract_payload(state.packets().last().unwrap()).unwrap(), vec![0x82]);
}

#[test]
fn failed_detection_resets_and_releases_the_port() {
    let mut s = status();
    s[20..22].copy_from_slice(&0x1234u16.to_be_bytes());
    let port = MockPort::new([mcu(&s)]);
    let state = port.state();
    let link = Link::new(port, config());
    let mut flashing = Flashing::new(protocol::open_serial(Family::Auto, link).unwrap());

    let err = flashing.connect(&ResetStrategy::Manual);
    assert!(matches!(err, Err(Error::Protocol(msg)) if msg.contains("cannot detect")));
    {
        let state = state.borrow();
        assert!(state.closed);
        assert_eq!(state.packets(), vec![F.encode(&[0x82])]);
    }
    // already released
    flashing.disconnect().unwrap();
    assert_eq!(state.borrow().packets().len(), 1);
}

#[test]
fn usb_family_needs_usb_transport() {
    let link = Link::new(MockPort::new(Vec::<Vec<u8>>::new()), config());
    assert!(matches!(
        protocol::open_serial(Family::Usb15, link),
        Err(Error::InvalidOption(_))
    ));
}

#[test]
fn unknown_options_are_reported_before_programming() {
    let mut replies = vec![mcu(&status())];
    replies.extend(handshake_replies());
    let port = MockPort::new(replies);
    let state = port.state();
    let link = Link::new(port, config());
    let mut flashing = Flashing::new(protocol::open_serial(Family::Stc89, link).unwrap());
    flashing.connect(&ResetStrategy::Manual).unwrap();

    let mut plan = FlashPlan {
        code: Some(vec![0; 16]),
        ..Default::default()
    };
    plan.push_option("no_such_option=1").unwrap();
    assert!(matches!(
        flashing.run(&plan, &mut stcisp::progress::NoProgress),
        Err(Error::InvalidOption(_))
    ));
    // only the reset packet went out
    assert_eq!(state.borrow().packets().len(), 1);
}
