use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use peercall::net::{HttpClient, HttpRequest, HttpResponse};
use peercall::signaling::{
    EndCallPayload, InboundSignal, OfferPayload, OutboundSignal, SdpField, SignalKind,
    StartCallPayload,
};
use peercall::types::{
    CallId, CallStatus, CallType, LocalIdentity, SdpType, SessionDescription, UserId,
};
use peercall::{CallStatusClient, StatusError};
use serde_json::{Value, json};

#[derive(Default)]
struct RecordingHttpClient {
    status: u16,
    body: String,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingHttpClient {
    fn responding(status: u16, body: Value) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl HttpClient for RecordingHttpClient {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse {
            status_code: self.status,
            body: self.body.clone().into_bytes(),
        })
    }
}

fn frame_json(signal: &OutboundSignal) -> Value {
    serde_json::from_str(&signal.to_frame().unwrap()).unwrap()
}

#[test]
fn start_call_frame_uses_wire_names() {
    let signal = OutboundSignal::StartCall(StartCallPayload {
        host_user_id: UserId::new("alice"),
        recipient_user_id: UserId::new("bob"),
        title: None,
        call_type: Some(CallType::Video),
    });
    assert_eq!(
        frame_json(&signal),
        json!({
            "event": "start-call",
            "data": { "hostUserId": "alice", "recipientUserId": "bob", "callType": "VIDEO" }
        })
    );
}

#[test]
fn end_call_frame_carries_both_parties() {
    let signal = OutboundSignal::EndCall(EndCallPayload {
        call_id: CallId::new("c1"),
        caller_id: UserId::new("alice"),
        receiver_id: UserId::new("bob"),
    });
    assert_eq!(
        frame_json(&signal),
        json!({
            "event": "end-call",
            "data": { "callId": "c1", "callerId": "alice", "receiverId": "bob" }
        })
    );
}

#[test]
fn offer_frame_nests_session_description() {
    let signal = OutboundSignal::Offer(OfferPayload {
        room_id: CallId::new("c1"),
        offer: SessionDescription::offer("v=0").into(),
        receiver_id: Some(UserId::new("bob")),
    });
    let value = frame_json(&signal);
    assert_eq!(value["event"], "webrtc-offer");
    assert_eq!(value["data"]["roomId"], "c1");
    assert_eq!(value["data"]["offer"], json!({ "type": "offer", "sdp": "v=0" }));
}

#[test]
fn inbound_frames_decode_by_event_name() {
    let incoming = InboundSignal::from_frame(
        r#"{"event":"incoming-call","data":{"callId":"c9","from":"alice","title":"sync"}}"#,
    )
    .unwrap();
    assert_eq!(incoming.kind(), SignalKind::IncomingCall);
    assert_eq!(incoming.call_id(), &CallId::new("c9"));

    // Peers that send the SDP as a bare string are accepted.
    let answer = InboundSignal::from_frame(
        r#"{"event":"webrtc-answer","data":{"roomId":"c9","answer":"v=0"}}"#,
    )
    .unwrap();
    match answer {
        InboundSignal::Answer(payload) => {
            assert_eq!(payload.answer, SdpField::Raw("v=0".into()));
            let desc = payload.answer.into_description(SdpType::Answer);
            assert_eq!(desc.sdp_type, SdpType::Answer);
        }
        other => panic!("expected answer, got {other:?}"),
    }

    assert!(InboundSignal::from_frame(r#"{"event":"start-call","data":{}}"#).is_err());
}

#[tokio::test]
async fn status_client_fetches_wrapped_record() {
    let http = RecordingHttpClient::responding(
        200,
        json!({
            "data": {
                "id": "call 1",
                "status": "ACTIVE",
                "hostUserId": "alice",
                "recipientUserId": "bob"
            }
        }),
    );
    let client = CallStatusClient::new(
        http.clone(),
        "https://api.example.com/",
        LocalIdentity::new("alice", "t0ken"),
    );

    let record = client.fetch_status(&CallId::new("call 1")).await.unwrap();
    assert_eq!(record.status, CallStatus::Active);
    assert!(!record.status.is_terminal());

    let requests = http.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(
        requests[0].url,
        "https://api.example.com/call/call%201/status"
    );
    assert_eq!(requests[0].headers["Authorization"], "Bearer t0ken");
}

#[tokio::test]
async fn status_client_accepts_bare_record_and_maps_http_errors() {
    let http = RecordingHttpClient::responding(200, json!({ "id": "c2", "status": "MISSED" }));
    let client = CallStatusClient::new(http, "http://localhost:3000", LocalIdentity::new("a", "t"));
    let record = client.fetch_status(&CallId::new("c2")).await.unwrap();
    assert_eq!(record.status, CallStatus::Missed);
    assert!(record.status.is_terminal());

    let http = RecordingHttpClient::responding(404, json!({ "message": "not found" }));
    let client = CallStatusClient::new(http, "http://localhost:3000", LocalIdentity::new("a", "t"));
    match client.fetch_status(&CallId::new("gone")).await {
        Err(StatusError::Http { status }) => assert_eq!(status, 404),
        other => panic!("expected HTTP error, got {other:?}"),
    }
}
