//! Firestore integration tests, run against the emulator or a real project.

use mvault_models::{
    CollaboratorRef, MediaType, NewTranscript, PostId, StorageUrlDecision, TranscriptOwner,
};
use mvault_store::{FirestoreStore, MediaRepo, TranscriptRepo};

async fn store() -> FirestoreStore {
    dotenvy::dotenv().ok();
    FirestoreStore::from_env()
        .await
        .expect("Failed to create Firestore store")
}

#[tokio::test]
#[ignore = "requires Firestore emulator or credentials"]
async fn test_media_registration_and_local_wins() {
    let store = store().await;
    let post_id = PostId::new();

    let media = store
        .register_remote(&post_id, 0, MediaType::Video, "https://cdn.example.com/a.mp4")
        .await
        .unwrap();
    let rematched = store
        .register_remote(&post_id, 0, MediaType::Video, "https://cdn.example.com/b.mp4")
        .await
        .unwrap();
    assert_eq!(rematched.id, media.id);
    assert_eq!(rematched.storage_url, "https://cdn.example.com/b.mp4");

    let local = format!("/content/it/posts/{}.mp4", media.id);
    assert_eq!(
        store.set_storage_url(&media.id, &local).await.unwrap(),
        StorageUrlDecision::Replace
    );
    assert_eq!(
        store
            .set_storage_url(&media.id, "https://cdn.example.com/c.mp4")
            .await
            .unwrap(),
        StorageUrlDecision::KeepLocal
    );
    let stored = MediaRepo::get(&store, &media.id).await.unwrap().unwrap();
    assert_eq!(stored.storage_url, local);
}

#[tokio::test]
#[ignore = "requires Firestore emulator or credentials"]
async fn test_concurrent_transcript_creates_converge() {
    let store = store().await;
    let post_id = PostId::new();
    let owner = TranscriptOwner::Media {
        post_id: post_id.clone(),
        media_id: mvault_models::MediaId::new(),
    };

    let (a, b) = tokio::join!(
        store.create_if_absent(NewTranscript::new(owner.clone(), "first", serde_json::json!({}))),
        store.create_if_absent(NewTranscript::new(owner.clone(), "second", serde_json::json!({}))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.transcript().id, b.transcript().id);
    assert_eq!(a.transcript().text, b.transcript().text);
    assert!(a.created() ^ b.created());

    let found = store.find_by_owner(&owner).await.unwrap().unwrap();
    assert_eq!(found.id, owner.document_id());
}

#[test]
fn test_collaborator_ref_shape() {
    let collaborator = CollaboratorRef::new("bob", "coauthor").with_profile_pic("/content/a/profiles/bob.jpg");
    let json = serde_json::to_value(&collaborator).unwrap();
    assert_eq!(json["profilePicUrl"], "/content/a/profiles/bob.jpg");
}
