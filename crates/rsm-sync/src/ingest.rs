//! Ingestion stage: pull pages after the cursor and commit them.

use std::sync::Arc;

use rsm_adapters::ItemSource;
use rsm_core::{Cursor, SourceError};
use rsm_storage::{Clock, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionResult {
    pub fetched: u64,
    pub inserted: u64,
    pub pages: u64,
    /// Cursor as committed at the end of the stage.
    #[serde(skip)]
    pub cursor: Cursor,
}

pub struct IngestionStage {
    store: Store,
    clock: Arc<dyn Clock>,
    max_pages: Option<usize>,
}

impl IngestionStage {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_pages: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Every page commits its own items. The last page (source exhausted or
    /// page cap reached) commits together with the advanced cursor; a capped
    /// run also stores the resume token so the next run picks up after the
    /// last item served. A source error leaves committed pages in place and
    /// the cursor untouched.
    pub async fn run(&self, source: &dyn ItemSource) -> Result<IngestionResult, IngestError> {
        let span = info_span!("ingest", source = source.source_id());
        async {
            let cursor = self.store.get_cursor().await?;
            let mut result = IngestionResult {
                cursor: cursor.clone(),
                ..IngestionResult::default()
            };
            let mut newest = None;
            let mut token = cursor.token.clone();

            loop {
                let page = source.fetch_page(&cursor, token.as_deref()).await?;
                result.pages += 1;
                result.fetched += page.items.len() as u64;
                newest = page
                    .items
                    .iter()
                    .map(|item| item.source_created_at)
                    .chain(newest)
                    .max();

                let capped = self
                    .max_pages
                    .is_some_and(|max| result.pages >= max as u64);
                let last = page.next.is_none() || capped;

                let mut tx = self.store.begin().await?;
                let inserted = tx.put_items(&page.items).await?;
                result.inserted += inserted;

                if last {
                    let mut advanced = cursor.advanced_to(newest, self.clock.wall());
                    advanced.token = if capped { page.next.clone() } else { None };
                    if advanced.watermark != cursor.watermark || advanced.token != cursor.token {
                        tx.set_cursor(&advanced).await?;
                        result.cursor = advanced;
                    }
                    tx.commit().await?;
                    debug!(
                        page = result.pages,
                        inserted,
                        resume = ?result.cursor.token,
                        "final page committed"
                    );
                    break;
                }

                tx.commit().await?;
                debug!(page = result.pages, inserted, "page committed");
                token = page.next;
            }

            info!(
                fetched = result.fetched,
                inserted = result.inserted,
                pages = result.pages,
                watermark = ?result.cursor.watermark,
                "ingestion finished"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }
}
