//! End-to-end flow over SQLite and the filesystem object store: ingest
//! DOCX and PDF fixtures, search, chat with citations, continue a truncated
//! answer, recover a stuck document, and tear a document down.
//!
//! The embedder hashes words into a small vector and the chat model replays
//! scripted answers, so no network is needed.

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document as PdfDocument, Object, Stream};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use doctalk::app::Services;
use doctalk::chat::{ContinueRequest, TurnRequest};
use doctalk::config::{parse_config, Config};
use doctalk::embedding::Embedder;
use doctalk::events::ChatEvent;
use doctalk::llm::{Script, ScriptedModel};
use doctalk::models::{ChatSession, DocumentStatus, Plan, Role, SessionScope, User};
use doctalk::ocr::DisabledOcr;
use doctalk::storage::ObjectStore;
use doctalk::store::{new_id, AccountStore, ChatStore, DocumentStore};

const DIMS: usize = 64;

/// Bag of words hashed into `DIMS` buckets.
struct HashingEmbedder;

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-test"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for word in t
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| w.len() > 3)
                {
                    let h = word
                        .to_lowercase()
                        .bytes()
                        .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                    v[(h as usize) % DIMS] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn config(tmp: &TempDir) -> Config {
    parse_config(&format!(
        r#"[db]
path = "{root}/data/doctalk.sqlite"

[storage]
root = "{root}/objects"

[retrieval]
min_chunk_text_len = 20

[embedding]
batch_size = 2
batch_delay_ms = 0
"#,
        root = tmp.path().display()
    ))
    .unwrap()
}

async fn services(tmp: &TempDir, scripts: Vec<Script>) -> Services {
    Services::open_with(
        &config(tmp),
        Arc::new(HashingEmbedder),
        Arc::new(ScriptedModel::new(scripts)),
        Arc::new(DisabledOcr),
    )
    .await
    .unwrap()
}

fn docx_fixture(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>\
         <w:p><w:pPr><w:pStyle w:val=\"Heading1\"/></w:pPr><w:r><w:t>Quarterly Review</w:t></w:r></w:p>{}</w:body></w:document>",
        body
    );
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

/// One page per entry, one text line per string.
fn pdf_fixture(pages: &[&[&str]]) -> Vec<u8> {
    let mut doc = PdfDocument::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for lines in pages {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 11.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
        ];
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                operations.push(Operation::new("Td", vec![0.into(), (-16).into()]));
            }
            operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
        }
        operations.push(Operation::new("ET", vec![]));
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

const REVIEW: &[&str] = &[
    "Revenue grew by twelve percent compared with the previous quarter, driven by subscription renewals.",
    "Operating margin improved to eighteen percent as hosting costs declined after the migration.",
    "The board approved a hiring plan that adds forty engineers across three regional offices.",
];

async fn add_user(services: &Services, balance: i64) {
    services
        .store
        .create_user(&User {
            id: "u1".into(),
            plan: Plan::Plus,
            credits_balance: balance,
            monthly_credits_granted_at: Some(chrono::Utc::now()),
        })
        .await
        .unwrap();
}

async fn open_session(services: &Services, document_id: &str) -> String {
    let session = ChatSession {
        id: new_id(),
        user_id: Some("u1".into()),
        scope: SessionScope::Document(document_id.to_string()),
        title: None,
    };
    services.store.create_session(&session).await.unwrap();
    session.id
}

async fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

#[tokio::test(flavor = "multi_thread")]
async fn docx_and_pdf_are_ingested_and_searchable() {
    let tmp = TempDir::new().unwrap();
    let services = services(&tmp, vec![]).await;

    let docx_path = tmp.path().join("review.docx");
    std::fs::write(&docx_path, docx_fixture(REVIEW)).unwrap();
    let docx = services
        .ingest
        .ingest_file(Some("u1"), &docx_path)
        .await
        .unwrap();
    assert_eq!(docx.status, DocumentStatus::Ready, "{:?}", docx.error_msg);
    assert!(docx.chunks_total >= 1);
    assert_eq!(docx.chunks_indexed, docx.chunks_total);

    let pdf_path = tmp.path().join("handbook.pdf");
    std::fs::write(
        &pdf_path,
        pdf_fixture(&[
            &[
                "Employees accrue vacation days monthly at a fixed rate.",
                "Unused vacation days carry over into the following year.",
            ],
            &[
                "Expense reports must be submitted within thirty days.",
                "Receipts are required for every expense above fifty dollars.",
            ],
        ]),
    )
    .unwrap();
    let pdf = services.ingest.ingest_file(None, &pdf_path).await.unwrap();
    assert_eq!(pdf.status, DocumentStatus::Ready, "{:?}", pdf.error_msg);
    assert_eq!(pdf.page_count, 2);

    let chunks = services.store.list_chunks(&pdf.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.vector_id.is_some()));
    for c in &chunks {
        for b in &c.bboxes {
            assert!((0.0..=1.0).contains(&b.x) && (0.0..=1.0).contains(&b.y));
        }
    }

    let results = services
        .retriever
        .search("vacation days", &[pdf.id.clone()], 3, false)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].text.contains("vacation"));

    let scoped = services
        .retriever
        .search("vacation days", &[docx.id.clone()], 3, false)
        .await
        .unwrap();
    assert!(scoped.iter().all(|f| !f.text.contains("vacation")));
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_turn_streams_citations_and_persists() {
    let tmp = TempDir::new().unwrap();
    let services = services(
        &tmp,
        vec![Script::answer(&["Revenue grew twelve ", "percent [1]", "."], 900, 40)],
    )
    .await;
    add_user(&services, 10_000).await;

    let path = tmp.path().join("review.docx");
    std::fs::write(&path, docx_fixture(REVIEW)).unwrap();
    let doc = services.ingest.ingest_file(Some("u1"), &path).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);
    let session_id = open_session(&services, &doc.id).await;

    let events = drain(services.chat.chat(TurnRequest {
        session_id: session_id.clone(),
        user_id: "u1".into(),
        message: "How much did revenue grow?".into(),
        mode: None,
    }))
    .await;

    let citation = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::Citation(c) => Some(c.clone()),
            _ => None,
        })
        .expect("citation event");
    assert_eq!(citation.ref_index, 1);
    assert_eq!(citation.offset, "Revenue grew twelve percent ".chars().count());
    let chunk_ids: Vec<String> = services
        .store
        .list_chunks(&doc.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert!(chunk_ids.contains(&citation.chunk_id));

    let Some(ChatEvent::Done { message_id, citations_count, can_continue, .. }) = events.last() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(*citations_count, 1);
    assert!(!can_continue);

    let stored = services.store.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(stored.role, Role::Assistant);
    assert_eq!(stored.content, "Revenue grew twelve percent .");
    assert_eq!(stored.citations.len(), 1);

    let history = services.store.recent_messages(&session_id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);

    let session = services.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.title.as_deref(), Some("How much did revenue grow?"));
    assert!(services.ledger.balance("u1").await.unwrap() < 10_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_answer_is_continued_in_place() {
    let tmp = TempDir::new().unwrap();
    let services = services(
        &tmp,
        vec![
            Script::answer(&["Margins improved [1]", " because"], 800, 2048).truncated(),
            Script::answer(&[" hosting costs fell [1]."], 900, 20),
        ],
    )
    .await;
    add_user(&services, 10_000).await;

    let path = tmp.path().join("review.docx");
    std::fs::write(&path, docx_fixture(REVIEW)).unwrap();
    let doc = services.ingest.ingest_file(Some("u1"), &path).await.unwrap();
    let session_id = open_session(&services, &doc.id).await;

    let first = drain(services.chat.chat(TurnRequest {
        session_id: session_id.clone(),
        user_id: "u1".into(),
        message: "Why did margins change?".into(),
        mode: Some("quick".into()),
    }))
    .await;
    assert!(first.iter().any(|e| matches!(e, ChatEvent::Truncated { .. })));
    let Some(ChatEvent::Done { message_id, can_continue: true, .. }) = first.last().cloned() else {
        panic!("expected a continuable done, got {:?}", first.last());
    };

    let second = drain(services.chat.continue_message(ContinueRequest {
        session_id: session_id.clone(),
        user_id: "u1".into(),
        message_id: message_id.clone(),
        mode: Some("quick".into()),
    }))
    .await;
    let offsets: Vec<usize> = second
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Citation(c) => Some(c.offset),
            _ => None,
        })
        .collect();
    assert_eq!(
        offsets,
        vec!["Margins improved  because hosting costs fell ".chars().count()]
    );

    let stored = services.store.get_message(&message_id).await.unwrap().unwrap();
    assert_eq!(stored.content, "Margins improved  because hosting costs fell .");
    assert_eq!(stored.continuation_count, 1);
    assert_eq!(stored.citations.len(), 2);
    let history = services.store.recent_messages(&session_id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn stuck_upload_is_recovered_and_teardown_removes_everything() {
    let tmp = TempDir::new().unwrap();
    let services = services(&tmp, vec![]).await;
    add_user(&services, 1_000).await;

    let doc = services
        .ingest
        .upload(Some("u1"), "review.docx", None, &docx_fixture(REVIEW))
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Parsing);

    let report = services.ingest.recover_stuck().await.unwrap();
    assert_eq!(report.redispatched, vec![doc.id.clone()]);
    let doc = services.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);
    assert!(services.objects.get(&doc.storage_key).await.is_ok());

    let session_id = open_session(&services, &doc.id).await;

    assert!(services
        .teardown
        .delete(&doc.id, Some("someone-else"))
        .await
        .unwrap()
        .is_none());

    let report = services
        .teardown
        .delete(&doc.id, Some("u1"))
        .await
        .unwrap()
        .unwrap();
    assert!(report.queued.is_empty());
    assert!(services.store.get_document(&doc.id).await.unwrap().is_none());
    assert!(services.store.get_session(&session_id).await.unwrap().is_none());
    assert!(services.store.list_chunks(&doc.id).await.unwrap().is_empty());
    assert!(services.objects.get(&doc.storage_key).await.is_err());

    let results = services
        .retriever
        .search("revenue", &[doc.id.clone()], 3, false)
        .await
        .unwrap();
    assert!(results.is_empty());
}
