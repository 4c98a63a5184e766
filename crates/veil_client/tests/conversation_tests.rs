use veil_client::{ChatClient, HandshakeState, Incoming};
use veil_proto::{ClientEvent, EncryptedEnvelope, ServerEvent, UserId};

fn uid(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

/// Deliver `frames` from `from` to `to` the way a relay would, returning
/// what `to` wants to send back.
fn route(from: &ChatClient, to: &mut ChatClient, frames: Vec<ClientEvent>) -> (Vec<Incoming>, Vec<ClientEvent>) {
    let mut incoming = Vec::new();
    let mut outgoing = Vec::new();
    for frame in frames {
        let event = match frame {
            ClientEvent::KeyExchange { payload, .. } => ServerEvent::KeyExchange {
                from_user_id: from.user_id().clone(),
                payload,
            },
            ClientEvent::EncryptedMessage {
                target_user_id,
                message_id,
                ciphertext,
                iv,
                kind,
                sender_info,
            } => ServerEvent::ReceiveMessage {
                envelope: EncryptedEnvelope {
                    id: message_id,
                    from_user_id: from.user_id().clone(),
                    to_user_id: target_user_id,
                    ciphertext,
                    iv,
                    kind,
                    sender_info,
                    created_at: chrono::Utc::now(),
                },
            },
            other => panic!("not routed in this test: {}", other.name()),
        };
        let handled = to.handle(event).unwrap();
        incoming.extend(handled.incoming);
        outgoing.extend(handled.outgoing);
    }
    (incoming, outgoing)
}

#[test]
fn three_step_handshake_then_bidirectional_chat() {
    let mut alice = ChatClient::new(uid("100001"), "alice").unwrap();
    let mut bob = ChatClient::new(uid("200002"), "bob").unwrap();

    let hello = alice.start_chat(bob.user_id()).unwrap();
    assert_eq!(alice.handshake_state(bob.user_id()), HandshakeState::KeySent);

    let (bob_in, bob_out) = route(&alice, &mut bob, vec![hello]);
    assert_eq!(bob.handshake_state(alice.user_id()), HandshakeState::Complete);
    assert!(matches!(bob_in[..], [Incoming::SecureChannelReady { .. }]));

    let (alice_in, alice_out) = route(&bob, &mut alice, bob_out);
    assert!(alice.is_handshake_complete(bob.user_id()));
    assert!(matches!(alice_in[..], [Incoming::SecureChannelReady { .. }]));

    // advisory acknowledgment changes nothing on the responder
    let (ack_in, ack_out) = route(&alice, &mut bob, alice_out);
    assert!(ack_in.is_empty() && ack_out.is_empty());

    let hi = alice.compose_text(bob.user_id(), "hi").unwrap();
    let (got, _) = route(&alice, &mut bob, vec![hi]);
    assert!(matches!(&got[..], [Incoming::Message { text, .. }] if text == "hi"));

    let back = bob.compose_text(alice.user_id(), "hello alice").unwrap();
    let (got, _) = route(&bob, &mut alice, vec![back]);
    assert!(matches!(&got[..], [Incoming::Message { text, .. }] if text == "hello alice"));
}

#[test]
fn message_sealed_for_someone_else_fails_closed() {
    let mut alice = ChatClient::new(uid("100001"), "alice").unwrap();
    let mut bob = ChatClient::new(uid("200002"), "bob").unwrap();
    let mut carol = ChatClient::new(uid("300003"), "carol").unwrap();

    let hello = alice.start_chat(bob.user_id()).unwrap();
    let (_, reply) = route(&alice, &mut bob, vec![hello]);
    route(&bob, &mut alice, reply);

    let hello = carol.start_chat(bob.user_id()).unwrap();
    let (_, reply) = route(&carol, &mut bob, vec![hello]);
    route(&bob, &mut carol, reply);

    // carol replays alice's ciphertext under her own name
    let frame = alice.compose_text(bob.user_id(), "secret").unwrap();
    let event = match frame {
        ClientEvent::EncryptedMessage {
            target_user_id,
            message_id,
            ciphertext,
            iv,
            kind,
            ..
        } => ServerEvent::ReceiveMessage {
            envelope: EncryptedEnvelope {
                id: message_id,
                from_user_id: carol.user_id().clone(),
                to_user_id: target_user_id,
                ciphertext,
                iv,
                kind,
                sender_info: None,
                created_at: chrono::Utc::now(),
            },
        },
        other => panic!("unexpected {}", other.name()),
    };
    let handled = bob.handle(event).unwrap();
    assert!(matches!(
        &handled.incoming[..],
        [Incoming::Undecryptable { from, .. }] if from == carol.user_id()
    ));
}
