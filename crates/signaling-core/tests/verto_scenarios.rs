//! Verto endpoint scenarios: echo on KMS and the FS bridge-to-session
//! flow.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use mediahub_infra_common::{ObjClass, Topic};
use mediahub_signaling_core::verto::protocol::VertoFrame;
use mediahub_signaling_core::{AllowAllLogin, VertoAdapter, VertoConn};
use mediahub_session_core::{SessionId, SessionType};

use common::{build_hub, service, Hub};

fn verto(hub: &Hub) -> VertoAdapter {
    let adapter = VertoAdapter::new(
        service(),
        hub.manager.clone(),
        hub.calls.clone(),
        Arc::new(AllowAllLogin),
    );
    hub.calls.register_plugin(adapter.plugin());
    hub.calls.register_resolver(adapter.resolver());
    adapter
}

async fn next_frame(conn: &mut VertoConn) -> VertoFrame {
    timeout(Duration::from_secs(2), conn.outbound.recv())
        .await
        .expect("frame in time")
        .expect("connection open")
}

async fn login(conn: &mut VertoConn, user: &str) {
    conn.handle_frame(VertoFrame::request(
        1,
        "login",
        json!({ "login": user, "passwd": "pw" }),
    ));
    let reply = next_frame(conn).await;
    assert!(reply.result.is_some(), "login accepted");
}

fn invite(conn: &VertoConn, id: u64, call_id: &str, dest: &str, sdp: &str) {
    conn.handle_frame(VertoFrame::request(
        id,
        "verto.invite",
        json!({
            "dialogParams": { "callID": call_id, "destination_number": dest },
            "sdp": sdp,
        }),
    ));
}

#[tokio::test]
async fn echo_invite_gets_async_answer_and_bye_stops_the_session() {
    let hub = build_hub();
    let adapter = verto(&hub);
    let bus = hub.manager.bus();
    let (_, mut topic_rx) = bus.subscribe(Topic::new("test", "media", ObjClass::Session), None);

    let mut conn = adapter.connect();
    login(&mut conn, "alice").await;

    invite(&conn, 2, "vc-1", "e", "alice-offer");

    // Command response first, carrying the session id.
    let reply = next_frame(&mut conn).await;
    assert_eq!(reply.id, Some(2));
    let session_id = reply.result.as_ref().unwrap()["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Then the asynchronous verto.answer with the engine's SDP.
    let answer = next_frame(&mut conn).await;
    assert_eq!(answer.method.as_deref(), Some("verto.answer"));
    let params = answer.params.unwrap();
    assert_eq!(params["dialogParams"]["callID"], "vc-1");
    assert!(params["sdp"].as_str().unwrap().contains("kms-answer"));

    // The echo leg runs on the KMS engine, looped onto itself.
    let info = hub
        .manager
        .session(&SessionId(session_id.clone()))
        .unwrap()
        .get_info()
        .await
        .unwrap();
    assert_eq!(info.session_type, SessionType::Echo);
    assert_eq!(hub.kms.connects.lock().unwrap().len(), 1);

    // Bye stops the session with verto_bye.
    conn.handle_frame(VertoFrame::request(
        3,
        "verto.bye",
        json!({ "dialogParams": { "callID": "vc-1" } }),
    ));
    let stop = timeout(Duration::from_secs(2), async {
        loop {
            let frame = topic_rx.recv().await.unwrap();
            if frame.event_type == "stop" && frame.obj_id == session_id {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stop.body["reason"], "verto_bye");
}

#[tokio::test]
async fn fs_bridge_to_session_links_both_legs_and_survivor_reparks() {
    let hub = build_hub();
    let adapter = verto(&hub);

    let mut first = adapter.connect();
    login(&mut first, "alice").await;
    invite(&first, 2, "vc-a", "fA", "offer-a");
    let reply = next_frame(&mut first).await;
    let first_session = reply.result.as_ref().unwrap()["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    // Parked leg answers immediately.
    let answer = next_frame(&mut first).await;
    assert_eq!(answer.method.as_deref(), Some("verto.answer"));

    let mut second = adapter.connect();
    login(&mut second, "bob").await;
    invite(&second, 2, "vc-b", &format!("f{first_session}"), "offer-b");
    let reply = next_frame(&mut second).await;
    let second_session = reply.result.as_ref().unwrap()["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    let answer = next_frame(&mut second).await;
    assert_eq!(answer.method.as_deref(), Some("verto.answer"));

    // The bridge settles asynchronously after the second start.
    let first_id = SessionId(first_session.clone());
    let second_id = SessionId(second_session.clone());
    timeout(Duration::from_secs(2), async {
        loop {
            let a = hub
                .manager
                .session(&first_id)
                .unwrap()
                .get_info()
                .await
                .unwrap();
            let b = hub
                .manager
                .session(&second_id)
                .unwrap()
                .get_info()
                .await
                .unwrap();
            if a.session_type == SessionType::Bridge && b.session_type == SessionType::Bridge {
                assert_eq!(a.type_ext.peer_id, Some(second_id.clone()));
                assert_eq!(b.type_ext.peer_id, Some(first_id.clone()));
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("both legs report the bridge");

    // First leg hangs up; the second returns to park.
    first.handle_frame(VertoFrame::request(
        3,
        "verto.bye",
        json!({ "dialogParams": { "callID": "vc-a" } }),
    ));
    timeout(Duration::from_secs(2), async {
        loop {
            let b = hub
                .manager
                .session(&second_id)
                .unwrap()
                .get_info()
                .await
                .unwrap();
            if b.session_type == SessionType::Park {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("survivor reparks");

    // The first client got its bye confirmation and the survivor's leg is
    // still up, parked.
    let reply = next_frame(&mut first).await;
    assert_eq!(reply.id, Some(3));
    assert!(hub.manager.session(&second_id).is_some());
}
