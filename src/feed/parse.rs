// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::FeedError;
use crate::model::PodcastMetadata;

/// Parse RSS feed XML bytes into podcast display metadata
pub fn parse_podcast_metadata(xml_bytes: &[u8]) -> Result<PodcastMetadata, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let cover_url = channel
        .itunes_ext()
        .and_then(|ext| ext.image())
        .map(String::from)
        .or_else(|| channel.image().map(|img| img.url().to_string()))
        .filter(|url| !url.is_empty());

    let artist = channel
        .itunes_ext()
        .and_then(|ext| ext.author().map(String::from))
        .or_else(|| channel.managing_editor().map(String::from));

    Ok(PodcastMetadata {
        name: channel.title().trim().to_string(),
        artist,
        cover_url_large: cover_url.clone(),
        cover_url,
        description: Some(plain_text(channel.description())).filter(|s| !s.is_empty()),
    })
}

/// Drop markup and decode entities, keeping line breaks of block tags
fn plain_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();

    let mut chars = html.chars().peekable();
    while let Some(c) = chars.next() {
        if in_tag {
            if c == '>' {
                if is_block_tag(&tag) {
                    text.push('\n');
                }
                in_tag = false;
                tag.clear();
            } else {
                tag.push(c);
            }
        } else if c == '<' && chars.peek().is_some_and(|&next| starts_tag(next)) {
            in_tag = true;
        } else {
            text.push(c);
        }
    }

    html_escape::decode_html_entities(&text).trim().to_string()
}

/// Whether the character after a `<` opens a tag
fn starts_tag(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '/' || c == '!'
}

fn is_block_tag(tag: &str) -> bool {
    let name = tag
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    matches!(
        name.as_str(),
        "p" | "div" | "br" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Test Podcast</title>
    <description>&lt;p&gt;A test podcast &amp;amp; more&lt;/p&gt;</description>
    <link>https://example.com</link>
    <itunes:author>Test Author</itunes:author>
    <itunes:image href="https://example.com/image.jpg"/>
    <item>
      <title>Episode 1</title>
      <enclosure url="https://example.com/ep1.mp3" length="1234567" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parse_extracts_podcast_metadata() {
        let metadata = parse_podcast_metadata(SAMPLE_FEED.as_bytes()).unwrap();

        assert_eq!(metadata.name, "Test Podcast");
        assert_eq!(metadata.artist, Some("Test Author".to_string()));
        assert_eq!(
            metadata.cover_url,
            Some("https://example.com/image.jpg".to_string())
        );
        assert_eq!(metadata.cover_url_large, metadata.cover_url);
        assert_eq!(metadata.description, Some("A test podcast & more".to_string()));
    }

    #[test]
    fn parse_handles_missing_optional_fields() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Bare</title>
    <description></description>
  </channel>
</rss>"#;

        let metadata = parse_podcast_metadata(feed.as_bytes()).unwrap();
        assert_eq!(metadata.name, "Bare");
        assert!(metadata.artist.is_none());
        assert!(metadata.cover_url.is_none());
        assert!(metadata.description.is_none());
    }

    #[test]
    fn parse_rejects_non_rss() {
        assert!(parse_podcast_metadata(b"<html></html>").is_err());
    }

    #[test]
    fn plain_text_breaks_block_tags() {
        assert_eq!(plain_text("<p>one</p><p>two<br/>three</p>"), "one\n\ntwo\nthree");
        assert_eq!(plain_text("<b>bold</b> &lt;3"), "bold <3");
    }

    #[test]
    fn plain_text_keeps_literal_less_than() {
        assert_eq!(plain_text("a < b and c > d"), "a < b and c > d");
        assert_eq!(plain_text("1 <2 <i>x</i>"), "1 <2 x");
        assert_eq!(plain_text("end <"), "end <");
        assert_eq!(plain_text("<!-- note -->text"), "text");
    }
}
