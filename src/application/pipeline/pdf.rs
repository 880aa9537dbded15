//! Merging of per-page PDF artifacts into a single document.

use std::collections::BTreeMap;

use bytes::Bytes;
use lopdf::{Document, Object, ObjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no page artifacts to merge")]
    NoPages,
    #[error("page artifact {page_index} is not a valid document: {source}")]
    InvalidArtifact {
        page_index: i32,
        #[source]
        source: lopdf::Error,
    },
    #[error("merged output has no catalog")]
    MissingCatalog,
    #[error("merged output has no page tree")]
    MissingPageTree,
    #[error("serializing merged document: {0}")]
    Serialize(#[source] std::io::Error),
    #[error("merge worker panicked")]
    Join,
}

/// Concatenate per-page PDFs, already ordered, into one document. Parsing and
/// object surgery are CPU-bound so the whole merge runs on a blocking thread.
pub async fn concat_pages(pages: Vec<(i32, Bytes)>) -> Result<Bytes, MergeError> {
    tokio::task::spawn_blocking(move || concat_pages_blocking(pages))
        .await
        .map_err(|_| MergeError::Join)?
}

fn concat_pages_blocking(pages: Vec<(i32, Bytes)>) -> Result<Bytes, MergeError> {
    if pages.is_empty() {
        return Err(MergeError::NoPages);
    }

    let mut parsed = Vec::with_capacity(pages.len());
    for (page_index, bytes) in pages {
        let document = Document::load_mem(&bytes).map_err(|source| {
            MergeError::InvalidArtifact { page_index, source }
        })?;
        parsed.push(document);
    }

    let mut merged = merge_documents(parsed)?;
    let mut out = Vec::new();
    merged
        .save_to(&mut out)
        .map_err(MergeError::Serialize)?;
    Ok(Bytes::from(out))
}

/// Classic lopdf concatenation: renumber each input past the running maximum,
/// collect page objects in input order, then rebuild a single page tree and
/// catalog over the union of objects.
fn merge_documents(documents: Vec<Document>) -> Result<Document, MergeError> {
    let mut max_id = 1;
    let mut document_pages: BTreeMap<ObjectId, Object> = BTreeMap::new();
    let mut document_objects: BTreeMap<ObjectId, Object> = BTreeMap::new();
    let mut merged = Document::with_version("1.5");

    for mut document in documents {
        document.renumber_objects_with(max_id);
        max_id = document.max_id + 1;

        for object_id in document.get_pages().into_values() {
            if let Ok(object) = document.get_object(object_id) {
                document_pages.insert(object_id, object.to_owned());
            }
        }
        document_objects.extend(document.objects);
    }

    let mut catalog: Option<(ObjectId, Object)> = None;
    let mut page_tree: Option<(ObjectId, Object)> = None;

    for (object_id, object) in document_objects {
        match object.type_name().unwrap_or(b"") {
            b"Catalog" => {
                let id = catalog.as_ref().map(|(id, _)| *id).unwrap_or(object_id);
                catalog = Some((id, object));
            }
            b"Pages" => {
                if let Ok(dictionary) = object.as_dict() {
                    let mut dictionary = dictionary.clone();
                    if let Some((_, ref existing)) = page_tree {
                        if let Ok(existing) = existing.as_dict() {
                            dictionary.extend(existing);
                        }
                    }
                    let id = page_tree.as_ref().map(|(id, _)| *id).unwrap_or(object_id);
                    page_tree = Some((id, Object::Dictionary(dictionary)));
                }
            }
            // Page objects are re-parented below; outlines are dropped.
            b"Page" | b"Outlines" | b"Outline" => {}
            _ => {
                merged.objects.insert(object_id, object);
            }
        }
    }

    let (pages_id, pages_object) = page_tree.ok_or(MergeError::MissingPageTree)?;
    let (catalog_id, catalog_object) = catalog.ok_or(MergeError::MissingCatalog)?;

    for (object_id, object) in &document_pages {
        if let Ok(dictionary) = object.as_dict() {
            let mut dictionary = dictionary.clone();
            dictionary.set("Parent", pages_id);
            merged
                .objects
                .insert(*object_id, Object::Dictionary(dictionary));
        }
    }

    if let Ok(dictionary) = pages_object.as_dict() {
        let mut dictionary = dictionary.clone();
        dictionary.set("Count", document_pages.len() as u32);
        dictionary.set(
            "Kids",
            document_pages
                .keys()
                .map(|id| Object::Reference(*id))
                .collect::<Vec<_>>(),
        );
        merged
            .objects
            .insert(pages_id, Object::Dictionary(dictionary));
    }

    if let Ok(dictionary) = catalog_object.as_dict() {
        let mut dictionary = dictionary.clone();
        dictionary.set("Pages", pages_id);
        dictionary.remove(b"Outlines");
        merged
            .objects
            .insert(catalog_id, Object::Dictionary(dictionary));
    }

    merged.trailer.set("Root", catalog_id);
    merged.max_id = merged.objects.len() as u32;
    merged.renumber_objects();
    merged.compress();
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::{page_labels, single_page_pdf};

    #[tokio::test]
    async fn merges_pages_in_input_order() {
        let pages = vec![
            (0, single_page_pdf("first")),
            (1, single_page_pdf("second")),
            (2, single_page_pdf("third")),
        ];
        let merged = concat_pages(pages).await.expect("merge succeeds");
        assert_eq!(
            page_labels(&merged).expect("labels"),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let result = concat_pages(Vec::new()).await;
        assert!(matches!(result, Err(MergeError::NoPages)));
    }

    #[tokio::test]
    async fn corrupt_artifact_names_its_page() {
        let pages = vec![
            (0, single_page_pdf("ok")),
            (7, Bytes::from_static(b"not a pdf")),
        ];
        let result = concat_pages(pages).await;
        match result {
            Err(MergeError::InvalidArtifact { page_index, .. }) => assert_eq!(page_index, 7),
            other => panic!("expected InvalidArtifact, got {other:?}"),
        }
    }
}
