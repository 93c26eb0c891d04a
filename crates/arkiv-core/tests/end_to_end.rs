//! Cross-component tests: webhook in, archived PDF out.
//!
//! These drive the full router (middleware chain included) with a real
//! in-process executor and an in-memory TMS, and assert on the observable
//! results: HTTP statuses, files under the storage root, sidecar
//! contents, and ticket-side tag state.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arkiv_core::config::Settings;
use arkiv_core::ingress::{build_router, AppState};
use arkiv_core::pipeline::dispatcher::{InProcessExecutor, JobExecutor, ShutdownState};
use arkiv_core::signing::{Signer, SigningMaterial};
use arkiv_core::tms::models::{TmsArticle, TmsTicket};
use arkiv_core::tms::{TicketApi, TmsError};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use secrecy::SecretString;
use sha2::Sha256;
use tower::ServiceExt;

const SECRET: &str = "end-to-end-secret";

struct FakeTms {
    tags: Mutex<BTreeSet<String>>,
    notes: Mutex<Vec<String>>,
}

impl FakeTms {
    fn new(tags: &[&str]) -> Self {
        Self {
            tags: Mutex::new(tags.iter().map(|t| (*t).to_owned()).collect()),
            notes: Mutex::new(Vec::new()),
        }
    }

    fn tags(&self) -> BTreeSet<String> {
        self.tags.lock().unwrap().clone()
    }
}

#[async_trait]
impl TicketApi for FakeTms {
    async fn get_ticket(&self, ticket_id: u64) -> Result<TmsTicket, TmsError> {
        Ok(serde_json::from_value(serde_json::json!({
            "id": ticket_id,
            "number": "123456",
            "title": "Printer on fire",
            "created_at": "2026-02-01T08:00:00Z",
            "updated_at": "2026-02-07T09:30:00Z",
            "owner": {"id": 3, "login": "john.doe@example.local"},
            "customer": {"id": 9, "login": "jane", "email": "jane@acme.example"},
            "preferences": {"custom_fields": {
                "archive_path": "Customers > ACME GmbH > 2026",
                "archive_user_mode": "owner"
            }}
        }))
        .expect("fake ticket"))
    }

    async fn list_tags(&self, _ticket_id: u64) -> Result<Vec<String>, TmsError> {
        Ok(self.tags.lock().unwrap().iter().cloned().collect())
    }

    async fn list_articles(&self, _ticket_id: u64) -> Result<Vec<TmsArticle>, TmsError> {
        Ok(vec![serde_json::from_value(serde_json::json!({
            "id": 1,
            "created_at": "2026-02-01T09:00:00Z",
            "internal": false,
            "subject": "initial report",
            "body": "<p>It is <strong>on fire</strong>.</p>",
            "content_type": "text/html",
            "from": "jane@acme.example"
        }))
        .expect("fake article")])
    }

    async fn add_tag(&self, _ticket_id: u64, tag: &str) -> Result<(), TmsError> {
        self.tags.lock().unwrap().insert(tag.to_owned());
        Ok(())
    }

    async fn remove_tag(&self, _ticket_id: u64, tag: &str) -> Result<(), TmsError> {
        self.tags.lock().unwrap().remove(tag);
        Ok(())
    }

    async fn create_internal_note(
        &self,
        _ticket_id: u64,
        _subject: &str,
        body_html: &str,
    ) -> Result<(), TmsError> {
        self.notes.lock().unwrap().push(body_html.to_owned());
        Ok(())
    }
}

struct World {
    router: axum::Router,
    tms: Arc<FakeTms>,
    executor: Arc<InProcessExecutor>,
    _root: tempfile::TempDir,
    root_path: std::path::PathBuf,
}

fn self_signed_signer() -> Signer {
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509NameBuilder};

    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "arkiv e2e signer").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(
            &openssl::bn::BigNum::from_u32(4242)
                .unwrap()
                .to_asn1_integer()
                .unwrap(),
        )
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();

    Signer::new(SigningMaterial::from_parts(pkey, builder.build()).unwrap())
}

fn world(signing: bool, tags: &[&str]) -> World {
    let root = tempfile::tempdir().unwrap();
    let root_path = root.path().to_path_buf();

    let mut settings = Settings::default();
    settings.tms.base_url = "https://tms.example".to_owned();
    settings.tms.api_token = SecretString::from("api-token");
    settings.tms.webhook_secret = Some(SecretString::from(SECRET));
    settings.storage.root = root_path.clone();
    settings.signing.enabled = signing;
    let settings = Arc::new(settings);

    let shutdown = ShutdownState::new();
    let executor = Arc::new(InProcessExecutor::new(4, shutdown.clone()));
    let tms = Arc::new(FakeTms::new(tags));
    let signer = signing.then(|| Arc::new(self_signed_signer()));

    let state = AppState::assemble(
        settings,
        Arc::clone(&tms) as Arc<dyn TicketApi>,
        signer,
        None,
        Arc::clone(&executor) as Arc<dyn JobExecutor>,
        shutdown,
    )
    .unwrap();

    World {
        router: build_router(state),
        tms,
        executor,
        _root: root,
        root_path,
    }
}

fn signed_request(body: &[u8], delivery_id: Option<&str>) -> Request<Body> {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let mut builder = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .header("x-hub-signature", signature)
        .header("x-request-id", "e2e-request");
    if let Some(delivery_id) = delivery_id {
        builder = builder.header("x-delivery-id", delivery_id);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

async fn drain(world: &World) {
    assert!(
        world.executor.drain(Duration::from_secs(15)).await,
        "jobs did not drain"
    );
}

fn archived_paths(world: &World) -> (std::path::PathBuf, std::path::PathBuf) {
    let date = chrono::Utc::now().format("%Y-%m-%d");
    let dir = world
        .root_path
        .join("john.doe_example.local/Customers/ACME_GmbH/2026");
    (
        dir.join(format!("Ticket-123456_{date}.pdf")),
        dir.join(format!("Ticket-123456_{date}.pdf.json")),
    )
}

#[tokio::test]
async fn webhook_to_archive_happy_path() {
    let world = world(false, &["pdf:sign"]);
    let body = br#"{"ticket":{"id":123456}}"#;

    let response = world
        .router
        .clone()
        .oneshot(signed_request(body, Some("delivery-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["accepted"], true);
    assert_eq!(json["ticket_id"], 123_456);

    drain(&world).await;

    let (pdf_path, sidecar_path) = archived_paths(&world);
    let pdf = std::fs::read(&pdf_path).expect("PDF written");
    assert!(pdf.starts_with(b"%PDF"));

    let sidecar: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
    assert_eq!(sidecar["ticket_id"], 123_456);
    assert_eq!(sidecar["ticket_number"], "123456");
    assert_eq!(
        sidecar["sha256"],
        arkiv_core::audit::compute_sha256(&pdf),
        "sidecar checksum must match the bytes on disk"
    );
    assert_eq!(sidecar["signing"]["enabled"], false);

    // Ticket ends in the done state with one success note.
    let tags = world.tms.tags();
    assert!(tags.contains("pdf:signed"));
    assert!(!tags.contains("pdf:sign"));
    assert!(!tags.contains("pdf:processing"));
    let notes = world.tms.notes.lock().unwrap().clone();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("e2e-request"));
    assert!(notes[0].contains("delivery-1"));
}

#[tokio::test]
async fn signed_archive_fills_the_signature_container() {
    let world = world(true, &["pdf:sign"]);
    let body = br#"{"ticket_id": 123456}"#;

    let response = world
        .router
        .clone()
        .oneshot(signed_request(body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    drain(&world).await;

    let (pdf_path, sidecar_path) = archived_paths(&world);
    let pdf = std::fs::read(&pdf_path).expect("signed PDF written");
    let text = String::from_utf8_lossy(&pdf);
    assert!(text.contains("/SubFilter /ETSI.CAdES.detached"));
    // The contents placeholder carries real signature bytes now.
    let contents_at = text.find("/Contents <").unwrap() + "/Contents <".len();
    assert!(
        text[contents_at..contents_at + 16].chars().any(|c| c != '0'),
        "signature container still zeroed"
    );

    let sidecar: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
    assert_eq!(sidecar["signing"]["enabled"], true);
    assert_eq!(sidecar["signing"]["tsa_used"], false);
    assert_eq!(
        sidecar["signing"]["cert_fingerprint"]
            .as_str()
            .unwrap()
            .len(),
        64
    );
}

#[tokio::test]
async fn duplicate_delivery_archives_exactly_once() {
    let world = world(false, &["pdf:sign"]);
    let body = br#"{"ticket_id": 123456}"#;

    for _ in 0..2 {
        let response = world
            .router
            .clone()
            .oneshot(signed_request(body, Some("same-delivery")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        drain(&world).await;
        // Re-arm the trigger: only delivery dedup may stop the second run.
        world.tms.tags.lock().unwrap().insert("pdf:sign".to_owned());
        world.tms.tags.lock().unwrap().remove("pdf:signed");
    }

    assert_eq!(
        world.tms.notes.lock().unwrap().len(),
        1,
        "exactly one success note"
    );
}

#[tokio::test]
async fn tampered_body_never_reaches_the_pipeline() {
    let world = world(false, &["pdf:sign"]);
    let mut request = signed_request(br#"{"ticket_id": 123456}"#, None);
    *request.body_mut() = Body::from(&br#"{"ticket_id": 666}"#[..]);

    let response = world.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    drain(&world).await;
    assert!(
        std::fs::read_dir(&world.root_path).unwrap().next().is_none(),
        "nothing may be written for a tampered request"
    );
    assert_eq!(world.tms.tags(), ["pdf:sign".to_owned()].into());
}
