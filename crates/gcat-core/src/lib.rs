//! Core domain model for the game catalog ingest pipeline.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "gcat-core";

/// Rating code used when the detail page carries no age-rating icon.
pub const DEFAULT_RATING: &str = "BR0";
pub const SHORT_DESCRIPTION_CHARS: usize = 160;
pub const MAX_GALLERY_SCREENSHOTS: usize = 5;
pub const SCREENSHOT_FORMATTER_TOKEN: &str = "{formatter}";
pub const SCREENSHOT_FORMAT: &str = "product_card_v2_mobile_slider_639";

/// Content types the pipeline reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Developer,
    Publisher,
    Category,
    Platform,
    Game,
}

impl EntityKind {
    pub const RELATIONAL: [EntityKind; 4] = [
        EntityKind::Developer,
        EntityKind::Publisher,
        EntityKind::Category,
        EntityKind::Platform,
    ];

    /// Content-type uid understood by the content store and the upload endpoint.
    pub fn uid(self) -> &'static str {
        match self {
            EntityKind::Developer => "api::developer.developer",
            EntityKind::Publisher => "api::publisher.publisher",
            EntityKind::Category => "api::category.category",
            EntityKind::Platform => "api::platform.platform",
            EntityKind::Game => "api::game.game",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Developer => "developers",
            EntityKind::Publisher => "publishers",
            EntityKind::Category => "categories",
            EntityKind::Platform => "platforms",
            EntityKind::Game => "games",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Developer => "developer",
            EntityKind::Publisher => "publisher",
            EntityKind::Category => "category",
            EntityKind::Platform => "platform",
            EntityKind::Game => "game",
        };
        f.write_str(name)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPrice {
    #[serde(default)]
    pub final_money: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub name: String,
}

/// One record of the remote catalog feed. Read-only input to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub price: Option<ProductPrice>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub genres: Vec<Genre>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub operating_systems: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub developers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub cover_horizontal: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub screenshots: Vec<String>,
}

impl Product {
    /// Final price, or `0.00` when the feed has none.
    pub fn price_or_zero(&self) -> Decimal {
        self.price
            .as_ref()
            .and_then(|p| p.final_money.as_ref())
            .map(|m| m.amount)
            .unwrap_or_else(zero_price)
    }

    pub fn parsed_release_date(&self) -> Option<NaiveDate> {
        self.release_date.as_deref().and_then(parse_release_date)
    }

    /// Names supplied by the product for one relational kind, in feed order.
    pub fn relation_names(&self, kind: EntityKind) -> Vec<&str> {
        match kind {
            EntityKind::Developer => self.developers.iter().map(String::as_str).collect(),
            EntityKind::Publisher => self.publishers.iter().map(String::as_str).collect(),
            EntityKind::Category => self.genres.iter().map(|g| g.name.as_str()).collect(),
            EntityKind::Platform => self.operating_systems.iter().map(String::as_str).collect(),
            EntityKind::Game => Vec::new(),
        }
    }

    /// Screenshot URLs ready for download: first five, formatter substituted.
    pub fn gallery_urls(&self) -> Vec<String> {
        self.screenshots
            .iter()
            .take(MAX_GALLERY_SCREENSHOTS)
            .map(|template| template.replace(SCREENSHOT_FORMATTER_TOKEN, SCREENSHOT_FORMAT))
            .collect()
    }
}

pub fn zero_price() -> Decimal {
    Decimal::new(0, 2)
}

/// Accepts `2024-01-01`, `2024.01.01`, or an RFC 3339 timestamp.
pub fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    let head = raw.get(..10).unwrap_or(raw);
    ["%Y-%m-%d", "%Y.%m.%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())
}

/// ASCII spelling for symbols and Latin letters that slugs keep.
fn transliterate(c: char) -> Option<&'static str> {
    let mapped = match c {
        '&' => "and",
        '$' => "dollar",
        '%' => "percent",
        '<' => "less",
        '>' => "greater",
        '|' => "or",
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'æ' | 'Æ' => "ae",
        'ç' | 'Ç' => "c",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ñ' | 'Ñ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "o",
        'œ' | 'Œ' => "oe",
        'ß' => "ss",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        _ => return None,
    };
    Some(mapped)
}

/// Entity names are matched exactly and case-sensitively; only outer whitespace is dropped.
pub fn normalize_entity_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Lowercase ASCII slug. Whitespace and `-` separate words, symbols with an
/// ASCII spelling are spelled out, any other punctuation is deleted in place.
pub fn strict_slugify(input: &str) -> String {
    let mut words = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            words.push(c.to_ascii_lowercase());
        } else if c == '-' || c.is_whitespace() {
            words.push(' ');
        } else if let Some(mapped) = transliterate(c) {
            words.push_str(mapped);
        }
    }
    words.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Named taxonomy value shared across catalog entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalEntity {
    pub id: u64,
    pub kind: EntityKind,
    pub name: String,
    pub slug: String,
}

/// Descriptive fields scraped from the detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub description: String,
    pub short_description: String,
    pub rating: String,
}

/// First 160 characters of `text`; may cut mid-word.
pub fn short_description(text: &str) -> String {
    text.chars().take(SHORT_DESCRIPTION_CHARS).collect()
}

/// Payload submitted to the content store when creating a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntryDraft {
    pub name: String,
    pub slug: String,
    pub price: Decimal,
    pub release_date: Option<NaiveDate>,
    pub developers: Vec<u64>,
    #[serde(rename = "publisher")]
    pub publishers: Vec<u64>,
    pub categories: Vec<u64>,
    pub platforms: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
}

impl CatalogEntryDraft {
    pub fn relation_ids_mut(&mut self, kind: EntityKind) -> Option<&mut Vec<u64>> {
        match kind {
            EntityKind::Developer => Some(&mut self.developers),
            EntityKind::Publisher => Some(&mut self.publishers),
            EntityKind::Category => Some(&mut self.categories),
            EntityKind::Platform => Some(&mut self.platforms),
            EntityKind::Game => None,
        }
    }

    pub fn apply_enrichment(&mut self, enrichment: Enrichment) {
        self.description = Some(enrichment.description);
        self.short_description = Some(enrichment.short_description);
        self.rating = Some(enrichment.rating);
    }

    pub fn into_entry(self, id: u64) -> CatalogEntry {
        CatalogEntry {
            id,
            name: self.name,
            slug: self.slug,
            price: self.price,
            release_date: self.release_date,
            developers: self.developers,
            publishers: self.publishers,
            categories: self.categories,
            platforms: self.platforms,
            description: self.description,
            short_description: self.short_description,
            rating: self.rating,
            published_at: self.published_at,
        }
    }
}

/// Materialized catalog record as created in the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: u64,
    pub name: String,
    pub slug: String,
    pub price: Decimal,
    pub release_date: Option<NaiveDate>,
    pub developers: Vec<u64>,
    pub publishers: Vec<u64>,
    pub categories: Vec<u64>,
    pub platforms: Vec<u64>,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub rating: Option<String>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaField {
    #[default]
    Cover,
    Gallery,
}

impl MediaField {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaField::Cover => "cover",
            MediaField::Gallery => "gallery",
        }
    }
}

/// Image attached to an existing catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub source_url: String,
    pub field: MediaField,
    pub filename: String,
}

pub fn media_filename(entry_slug: &str, token: &str) -> String {
    format!("{entry_slug}_{token}.jpg")
}

/// Cover first, then the capped gallery, in source order. Filenames are filled in at upload time.
pub fn media_plan(product: &Product) -> Vec<(String, MediaField)> {
    let cover = product
        .cover_horizontal
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| (url.to_string(), MediaField::Cover));
    cover
        .into_iter()
        .chain(
            product
                .gallery_urls()
                .into_iter()
                .map(|url| (url, MediaField::Gallery)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn product_json(extra: serde_json::Value) -> Product {
        let mut base = serde_json::json!({
            "title": "Sample Game",
            "slug": "sample-game",
            "releaseDate": "2024-01-01",
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).expect("product json")
    }

    #[test]
    fn slugify_strips_punctuation_and_lowercases() {
        assert_eq!(strict_slugify("The Witcher 3: Wild Hunt"), "the-witcher-3-wild-hunt");
        assert_eq!(strict_slugify("  --Studio A-- "), "studio-a");
        assert_eq!(strict_slugify("Pub B"), "pub-b");
        assert_eq!(strict_slugify("Café Über & Co."), "cafe-uber-and-co");
        assert_eq!(strict_slugify("東京"), "");
    }

    #[test]
    fn slugify_deletes_punctuation_inside_words() {
        assert_eq!(strict_slugify("Assassin's Creed"), "assassins-creed");
        assert_eq!(strict_slugify("S.T.A.L.K.E.R."), "stalker");
        assert_eq!(strict_slugify("Dungeons & Dragons"), "dungeons-and-dragons");
        assert_eq!(strict_slugify("Half-Life 2"), "half-life-2");
        assert_eq!(strict_slugify("Baldur's Gate: Enhanced_Edition"), "baldurs-gate-enhancededition");
        assert_eq!(strict_slugify("100% Orange Juice"), "100percent-orange-juice");
    }

    #[test]
    fn entity_names_keep_case_and_drop_blank() {
        assert_eq!(normalize_entity_name("  Studio A "), Some("Studio A".to_string()));
        assert_eq!(normalize_entity_name("studio a"), Some("studio a".to_string()));
        assert_eq!(normalize_entity_name("   "), None);
    }

    #[test]
    fn missing_price_falls_back_to_zero() {
        let product = product_json(serde_json::json!({}));
        assert_eq!(product.price_or_zero(), Decimal::from_str("0.00").unwrap());
        assert_eq!(product.price_or_zero().to_string(), "0.00");

        let priced = product_json(serde_json::json!({
            "price": { "finalMoney": { "amount": "19.99", "currency": "USD" } }
        }));
        assert_eq!(priced.price_or_zero(), Decimal::from_str("19.99").unwrap());
    }

    #[test]
    fn null_lists_decode_as_empty() {
        let product = product_json(serde_json::json!({ "genres": null, "screenshots": null }));
        assert!(product.genres.is_empty());
        assert!(product.screenshots.is_empty());
        assert!(product.cover_horizontal.is_none());
    }

    #[test]
    fn release_dates_in_feed_formats_parse() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(parse_release_date("2024-01-01"), Some(expected));
        assert_eq!(parse_release_date("2024.01.01"), Some(expected));
        assert_eq!(parse_release_date("2024-01-01T10:00:00+00:00"), Some(expected));
        assert_eq!(parse_release_date("2024-01-01T10:00:00"), Some(expected));
        assert_eq!(parse_release_date("soon"), None);
        assert_eq!(parse_release_date(""), None);
    }

    #[test]
    fn gallery_is_capped_to_five_in_source_order() {
        let shots = (0..8)
            .map(|i| format!("https://img.example/{i}_{{formatter}}.jpg"))
            .collect::<Vec<_>>();
        let product = product_json(serde_json::json!({
            "coverHorizontal": "https://img.example/cover.jpg",
            "screenshots": shots,
        }));

        let plan = media_plan(&product);
        assert_eq!(plan.len(), 6);
        assert_eq!(plan[0], ("https://img.example/cover.jpg".to_string(), MediaField::Cover));
        let gallery = plan[1..].iter().map(|(url, _)| url.clone()).collect::<Vec<_>>();
        assert_eq!(
            gallery,
            (0..5)
                .map(|i| format!("https://img.example/{i}_product_card_v2_mobile_slider_639.jpg"))
                .collect::<Vec<_>>()
        );
        assert!(plan[1..].iter().all(|(_, field)| *field == MediaField::Gallery));
    }

    #[test]
    fn short_description_counts_characters_not_bytes() {
        let text = "é".repeat(200);
        let short = short_description(&text);
        assert_eq!(short.chars().count(), SHORT_DESCRIPTION_CHARS);
        assert!(text.starts_with(&short));
        assert_eq!(short_description("tiny"), "tiny");
    }

    #[test]
    fn draft_serializes_store_field_names() {
        let draft = CatalogEntryDraft {
            name: "Sample Game".into(),
            slug: "sample-game".into(),
            price: zero_price(),
            release_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            developers: vec![1],
            publishers: vec![2],
            categories: vec![3],
            platforms: vec![4],
            description: None,
            short_description: None,
            rating: None,
            published_at: Utc::now(),
        };
        let value = serde_json::to_value(&draft).unwrap();
        assert_eq!(value["publisher"], serde_json::json!([2]));
        assert_eq!(value["release_date"], serde_json::json!("2024-01-01"));
        assert_eq!(value["price"], serde_json::json!("0.00"));
        assert!(value.get("rating").is_none());
        assert!(value.get("publishedAt").is_some());
    }
}
