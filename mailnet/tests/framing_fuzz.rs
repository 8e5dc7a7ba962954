use rand::Rng;
use mailnet::link::DEFAULT_MAX_PACKET_PAYLOAD;
use mailnet::packet::{max_contents_len, FramingError, PORT_LIMIT};
use mailnet::{Endpoint, Flags, Message};

/// ------------------------------------------------------------
/// Helper functions for building random messages
/// ------------------------------------------------------------

const ROUNDS: usize = 2_000;

fn random_endpoint(rng: &mut impl Rng) -> Endpoint {
    Endpoint::new(rng.random(), rng.random_range(0..PORT_LIMIT) as u8)
}

fn random_flags(rng: &mut impl Rng) -> Flags {
    Flags::from_bits_truncate(rng.random_range(0..=0x0f))
}

fn random_message(rng: &mut impl Rng) -> Message {
    let flags = random_flags(rng);
    let len = if flags.is_control() {
        0
    } else {
        rng.random_range(0..=max_contents_len(DEFAULT_MAX_PACKET_PAYLOAD))
    };
    let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    Message::new(random_endpoint(rng), random_endpoint(rng), flags, rng.random(), payload)
}

/// ------------------------------------------------------------
/// Randomized framing tests
/// ------------------------------------------------------------

#[test]
fn fuzz_valid_messages_survive_the_wire() {
    let mut rng = rand::rng();

    for _ in 0..ROUNDS {
        let message = random_message(&mut rng);
        let packet = message
            .encode(DEFAULT_MAX_PACKET_PAYLOAD)
            .unwrap_or_else(|e| panic!("encode failed for {message}: {e}"));
        assert!(packet.bytes.len() <= DEFAULT_MAX_PACKET_PAYLOAD);

        let decoded = Message::decode(&packet).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn fuzz_control_flags_never_carry_payload() {
    let mut rng = rand::rng();

    for _ in 0..ROUNDS {
        let mut message = random_message(&mut rng);
        if !message.flags.is_control() {
            continue;
        }
        let extra = rng.random_range(1..=max_contents_len(DEFAULT_MAX_PACKET_PAYLOAD));
        message.payload = vec![0xaa; extra];

        assert_eq!(
            message.encode(DEFAULT_MAX_PACKET_PAYLOAD),
            Err(FramingError::ControlPayload(message.flags))
        );
    }
}

#[test]
fn fuzz_random_bytes_never_panic_decode() {
    let mut rng = rand::rng();

    for _ in 0..ROUNDS {
        let len = rng.random_range(0..=DEFAULT_MAX_PACKET_PAYLOAD);
        let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let packet = mailnet::Packet {
            src_link: rng.random(),
            dst_link: rng.random(),
            bytes,
        };

        // Whatever parses must frame back to the same bytes.
        if let Ok(message) = Message::decode(&packet) {
            let again = message.encode(DEFAULT_MAX_PACKET_PAYLOAD).unwrap();
            assert_eq!(again.bytes, packet.bytes);
        }
    }
}
