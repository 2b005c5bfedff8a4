#![forbid(unsafe_code)]

//! Expands a playlist URL into the video URLs it contains.

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use std::sync::LazyLock;
use std::time::Duration;

use crate::identity::{Platform, PlaylistRef, is_safe_id};
use crate::interrupt::Interrupt;
use crate::supervisor::{Toolchain, list_playlist_ids};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static CARD_TITLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a.wdp-playlist-video-card-module__title").expect("valid card title selector")
});

/// The `{id}` of a `/video/{id}` link, absolute or relative. Query and
/// fragment are ignored.
fn video_id_from_href(href: &str) -> Option<&str> {
    let path = href.split(['?', '#']).next()?;
    let mut segments = path.split('/').skip_while(|segment| *segment != "video");
    segments.next()?;
    segments.next().filter(|id| is_safe_id(id))
}

/// Video ids linked from the title anchors of a rutube playlist page, in
/// page order without repeats.
pub fn parse_rutube_playlist_page(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut ids: Vec<String> = Vec::new();
    for anchor in document.select(&CARD_TITLE) {
        if let Some(id) = anchor.value().attr("href").and_then(video_id_from_href)
            && !ids.iter().any(|known| known == id)
        {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Blocking HTTP fetch of a rutube playlist page.
pub fn fetch_rutube_playlist_ids(playlist_url: &str) -> Result<Vec<String>> {
    let body = ureq::get(playlist_url)
        .timeout(HTTP_TIMEOUT)
        .call()
        .with_context(|| format!("requesting {playlist_url}"))?
        .into_string()
        .with_context(|| format!("reading response body of {playlist_url}"))?;
    Ok(parse_rutube_playlist_page(&body))
}

/// Watch URLs of every video in `playlist`.
pub async fn playlist_video_urls(
    toolchain: &Toolchain,
    playlist: &PlaylistRef,
    interrupt: &Interrupt,
) -> Result<Vec<String>> {
    let ids = match playlist.platform {
        Platform::Youtube => list_playlist_ids(toolchain, &playlist.source_url, interrupt)
            .await
            .with_context(|| format!("listing playlist {}", playlist.source_url))?,
        Platform::Rutube => {
            let url = playlist.source_url.clone();
            tokio::task::spawn_blocking(move || fetch_rutube_playlist_ids(&url))
                .await
                .context("rutube playlist fetch task panicked")??
        }
    };
    Ok(ids
        .iter()
        .map(|id| playlist.platform.video_url(id))
        .collect())
}
