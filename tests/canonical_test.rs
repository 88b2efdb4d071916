use anyhow::Result;
use std::sync::Arc;

use playlog::canonical::Canonicalizer;
use playlog::domain::{Artist, EntityKind, ExternalRef, IdNamespace};
use playlog::error::PlaylogError;
use playlog::storage::{CatalogStore, InMemoryStore};

fn canon() -> (Arc<InMemoryStore>, Arc<Canonicalizer>) {
    let store = Arc::new(InMemoryStore::new());
    let canon = Arc::new(Canonicalizer::new(store.clone() as Arc<dyn CatalogStore>));
    (store, canon)
}

#[tokio::test]
async fn unresolvable_second_provider_id_falls_through_and_links() -> Result<()> {
    let (store, canon) = canon();

    // First observation links the entity under provider P1.
    let p1 = ExternalRef::new(IdNamespace::MusicBrainz, "mb-1");
    let original = canon.ensure_artist("Arthur Russell", &[p1]).await?;

    // Second observation carries only an unknown P2 id: resolution must
    // fall through to the structural match, not create a duplicate.
    let p2 = ExternalRef::new(IdNamespace::Spotify, "sp-9");
    let resolved = canon.ensure_artist("Arthur Russell", &[p2]).await?;
    assert_eq!(resolved.id, original.id);
    assert_eq!(store.stats().await?.artists, 1);

    // Afterwards both identifiers point at the same entity.
    let via_p1 = store.find_external(IdNamespace::MusicBrainz, "mb-1").await?.unwrap();
    let via_p2 = store.find_external(IdNamespace::Spotify, "sp-9").await?.unwrap();
    assert_eq!(via_p1.entity_id, original.id.unwrap());
    assert_eq!(via_p2.entity_id, original.id.unwrap());
    Ok(())
}

#[tokio::test]
async fn external_id_wins_over_structural_match() -> Result<()> {
    let (_, canon) = canon();

    // Two distinct real-world artists that normalize to different keys but
    // share a provider id history: the id decides.
    let id = ExternalRef::new(IdNamespace::MusicBrainz, "mb-aliased");
    let first = canon.ensure_artist("CAN", &[id.clone()]).await?;

    // A later observation under a different spelling still resolves by id.
    let second = canon.ensure_artist("The Can", &[id]).await?;
    assert_eq!(second.id, first.id);
    Ok(())
}

#[tokio::test]
async fn album_year_promotion_converges_to_one_row() -> Result<()> {
    let (store, canon) = canon();
    let artist = canon.ensure_artist("Talk Talk", &[]).await?;

    let placeholder = canon.ensure_album(&artist, "Laughing Stock", None, &[]).await?;
    assert_eq!(placeholder.year, None);

    let promoted = canon.ensure_album(&artist, "Laughing Stock", Some(1991), &[]).await?;
    assert_eq!(promoted.id, placeholder.id);
    assert_eq!(promoted.year, Some(1991));

    // A later year-less observation converges on the enriched row.
    let third = canon.ensure_album(&artist, "Laughing Stock", None, &[]).await?;
    assert_eq!(third.id, placeholder.id);
    assert_eq!(third.year, Some(1991));

    assert_eq!(store.stats().await?.albums, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_year_promotion_settles_without_errors() -> Result<()> {
    let (store, canon) = canon();
    let artist = canon.ensure_artist("Slint", &[]).await?;
    canon.ensure_album(&artist, "Spiderland", None, &[]).await?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let canon = canon.clone();
        let artist = artist.clone();
        handles.push(tokio::spawn(async move {
            canon.ensure_album(&artist, "Spiderland", Some(1991), &[]).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let album = handle.await??;
        assert_eq!(album.year, Some(1991));
        ids.push(album.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all racers must converge on one row");

    let rows = store
        .albums_by_artist_and_key(artist.id.unwrap(), "spiderland")
        .await?;
    assert_eq!(rows.iter().filter(|a| a.year == Some(1991)).count(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_parent_is_fatal() -> Result<()> {
    let (_, canon) = canon();

    let mut ghost = Artist::new("Ghost");
    ghost.id = Some(424242);

    let err = canon.ensure_album(&ghost, "Nothing", None, &[]).await.unwrap_err();
    match err {
        PlaylogError::MissingParent { kind, id } => {
            assert_eq!(kind, EntityKind::Artist);
            assert_eq!(id, 424242);
        }
        other => panic!("expected MissingParent, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn external_links_are_additive_never_rewritten() -> Result<()> {
    let (store, canon) = canon();

    let shared = ExternalRef::new(IdNamespace::Spotify, "sp-shared");
    let first = canon.ensure_artist("Moondog", &[shared.clone()]).await?;

    // A different entity arriving with an already-claimed id must not steal
    // the mapping.
    let second = canon.ensure_artist("Suicide", &[shared]).await?;
    assert_ne!(second.id, first.id);

    let link = store.find_external(IdNamespace::Spotify, "sp-shared").await?.unwrap();
    assert_eq!(link.entity_id, first.id.unwrap());
    Ok(())
}
