use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Date, Month};
use ulid::Ulid;

pub const RATING_MIN: i32 = 0;
pub const RATING_MAX: i32 = 10;

/// Sort key used for records whose date is absent or unparseable.
pub const EPOCH_DATE: Date = time::macros::date!(1970 - 01 - 01);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JournalError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("dream not found: {0}")]
    NotFound(String),
    #[error("duplicate dream id: {0}")]
    Duplicate(String),
}

/// Dream identifier, compared by its text.
///
/// Older journals stored the creation timestamp as a bare integer. Such ids are written back
/// as integers so untouched records keep their stored shape.
#[derive(Debug, Clone)]
pub struct DreamId {
    value: String,
    numeric: bool,
}

impl DreamId {
    #[must_use]
    pub fn new() -> Self {
        Self::from(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// True when the id was decoded from a JSON integer.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.numeric
    }
}

impl PartialEq for DreamId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for DreamId {}

impl Ord for DreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl PartialOrd for DreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for DreamId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl Default for DreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<String> for DreamId {
    fn from(value: String) -> Self {
        Self { value, numeric: false }
    }
}

impl From<&str> for DreamId {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl Serialize for DreamId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.numeric {
            if let Ok(value) = self.value.parse::<i64>() {
                return serializer.serialize_i64(value);
            }
            if let Ok(value) = self.value.parse::<u64>() {
                return serializer.serialize_u64(value);
            }
        }
        serializer.serialize_str(&self.value)
    }
}

impl<'de> Deserialize<'de> for DreamId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Older journals stored the creation timestamp as a bare integer.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        let (value, numeric) = match RawId::deserialize(deserializer)? {
            RawId::Text(value) => (value, false),
            RawId::Signed(value) => (value.to_string(), true),
            RawId::Unsigned(value) => (value.to_string(), true),
        };
        if value.trim().is_empty() {
            return Err(serde::de::Error::custom("dream id MUST be non-empty"));
        }
        Ok(Self { value, numeric })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DreamRecord {
    pub id: DreamId,
    #[serde(default, deserialize_with = "lenient_text")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub is_lucid: bool,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub location: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub characters: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub emotion: String,
    #[serde(default, deserialize_with = "lenient_rating")]
    pub intensity: i32,
    #[serde(default, deserialize_with = "lenient_rating")]
    pub clarity: i32,
    #[serde(default, deserialize_with = "lenient_rating")]
    pub sleep_quality: i32,
}

impl DreamRecord {
    /// Calendar date of the entry, when present and well formed.
    #[must_use]
    pub fn calendar_date(&self) -> Option<Date> {
        self.date.as_deref().and_then(parse_calendar_date)
    }

    #[must_use]
    pub fn sort_key(&self) -> Date {
        self.calendar_date().unwrap_or(EPOCH_DATE)
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRating {
    Integer(i64),
    Float(f64),
    Text(String),
}

// Entry forms historically persisted ratings as the raw text the user typed.
fn lenient_rating<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let rating = match Option::<RawRating>::deserialize(deserializer)? {
        None => 0,
        Some(RawRating::Integer(value)) => {
            i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
        }
        Some(RawRating::Float(value)) => rounded_rating(value),
        Some(RawRating::Text(value)) => parse_rating(&value).unwrap_or(0),
    };
    Ok(rating)
}

#[allow(clippy::cast_possible_truncation)]
fn rounded_rating(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

/// Parse a user-entered rating. Blank or non-integer input yields `None`.
#[must_use]
pub fn parse_rating(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i32>().ok()
}

/// Parse a strict `YYYY-MM-DD` calendar date.
#[must_use]
pub fn parse_calendar_date(raw: &str) -> Option<Date> {
    let bytes = raw.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let all_digits = bytes
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != 4 && *index != 7)
        .all(|(_, byte)| byte.is_ascii_digit());
    if !all_digits {
        return None;
    }

    let year = raw[0..4].parse::<i32>().ok()?;
    let month = Month::try_from(raw[5..7].parse::<u8>().ok()?).ok()?;
    let day = raw[8..10].parse::<u8>().ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

#[must_use]
pub fn format_calendar_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

fn is_hashtag_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Extract `#word` tokens from free text, first occurrence order, duplicates removed.
#[must_use]
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut hashtags = Vec::new();
    for segment in segment_hashtags(text) {
        if segment.kind == SegmentKind::Hashtag && seen.insert(segment.text.clone()) {
            hashtags.push(segment.text);
        }
    }
    hashtags
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Plain,
    Hashtag,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TextSegment {
    pub kind: SegmentKind,
    pub text: String,
}

/// Split text into alternating plain and hashtag runs for highlighting.
///
/// Concatenating the segment texts yields the input unchanged.
#[must_use]
pub fn segment_hashtags(text: &str) -> Vec<TextSegment> {
    fn push_plain(segments: &mut Vec<TextSegment>, value: &str) {
        if value.is_empty() {
            return;
        }
        if let Some(last) = segments.last_mut() {
            if last.kind == SegmentKind::Plain {
                last.text.push_str(value);
                return;
            }
        }
        segments.push(TextSegment { kind: SegmentKind::Plain, text: value.to_string() });
    }

    let mut segments = Vec::new();
    let mut plain_start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if ch != '#' {
            continue;
        }
        let mut end = index + 1;
        while let Some(&(next_index, next)) = chars.peek() {
            if !is_hashtag_char(next) {
                break;
            }
            end = next_index + next.len_utf8();
            chars.next();
        }
        if end == index + 1 {
            continue;
        }

        push_plain(&mut segments, &text[plain_start..index]);
        segments
            .push(TextSegment { kind: SegmentKind::Hashtag, text: text[index..end].to_string() });
        plain_start = end;
    }
    push_plain(&mut segments, &text[plain_start..]);

    segments
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct CatalogTag {
    pub label: &'static str,
    pub value: &'static str,
}

pub const TAG_CATALOG: [CatalogTag; 27] = [
    CatalogTag { label: "Adventure", value: "#Adventure\u{1F3DE}\u{FE0F}" },
    CatalogTag { label: "Flight", value: "#Flight\u{2708}\u{FE0F}" },
    CatalogTag { label: "Nightmare", value: "#Nightmare\u{1F631}" },
    CatalogTag { label: "Love", value: "#Love\u{2764}\u{FE0F}" },
    CatalogTag { label: "Chase", value: "#Chase" },
    CatalogTag { label: "Fantasy", value: "#Fantasy" },
    CatalogTag { label: "Family", value: "#Family" },
    CatalogTag { label: "Future", value: "#Future" },
    CatalogTag { label: "Magic", value: "#Magic" },
    CatalogTag { label: "Falling", value: "#Falling" },
    CatalogTag { label: "School", value: "#School" },
    CatalogTag { label: "Work", value: "#Work" },
    CatalogTag { label: "Animals", value: "#Animals" },
    CatalogTag { label: "Travel", value: "#Travel" },
    CatalogTag { label: "Stranger", value: "#Stranger" },
    CatalogTag { label: "Mystery", value: "#Mystery" },
    CatalogTag { label: "Exploration", value: "#Exploration" },
    CatalogTag { label: "Castle", value: "#Castle" },
    CatalogTag { label: "Sunrise", value: "#Sunrise" },
    CatalogTag { label: "Starry night", value: "#StarryNight" },
    CatalogTag { label: "Space", value: "#Space" },
    CatalogTag { label: "Party", value: "#Party" },
    CatalogTag { label: "Performance", value: "#Performance" },
    CatalogTag { label: "Beach", value: "#Beach" },
    CatalogTag { label: "Nature", value: "#Nature" },
    CatalogTag { label: "Secret", value: "#Secret" },
    CatalogTag { label: "Puzzle", value: "#Puzzle" },
];

impl CatalogTag {
    /// The value without its emoji suffix, e.g. `#Flight`.
    #[must_use]
    pub fn plain_value(&self) -> &'static str {
        self.value.trim_end_matches(|c: char| !c.is_ascii())
    }
}

/// Stored catalog value for `value`, which may be the stored spelling or its plain form.
#[must_use]
pub fn catalog_tag(value: &str) -> Option<&'static str> {
    TAG_CATALOG
        .iter()
        .find(|tag| tag.value == value || tag.plain_value() == value)
        .map(|tag| tag.value)
}

#[must_use]
pub fn is_catalog_tag(value: &str) -> bool {
    catalog_tag(value).is_some()
}

/// User-supplied fields for creating or editing one dream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DreamDraft {
    pub text: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub is_lucid: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub characters: String,
    #[serde(default)]
    pub emotion: String,
    #[serde(default)]
    pub intensity: i32,
    #[serde(default)]
    pub clarity: i32,
    #[serde(default)]
    pub sleep_quality: i32,
}

impl DreamDraft {
    /// Check a draft before it becomes a stored record.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] when the text is blank, the date is not a real
    /// `YYYY-MM-DD` calendar date, a rating is outside 0..=10, or a tag is not in the catalog.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.text.trim().is_empty() {
            return Err(JournalError::Validation("text MUST be provided".to_string()));
        }

        if let Some(date) = &self.date {
            if parse_calendar_date(date).is_none() {
                return Err(JournalError::Validation(format!(
                    "date MUST be a valid calendar date formatted as YYYY-MM-DD (got `{date}`)"
                )));
            }
        }

        for (name, value) in [
            ("intensity", self.intensity),
            ("clarity", self.clarity),
            ("sleepQuality", self.sleep_quality),
        ] {
            if !(RATING_MIN..=RATING_MAX).contains(&value) {
                return Err(JournalError::Validation(format!(
                    "{name} MUST be in [{RATING_MIN}, {RATING_MAX}] (got {value})"
                )));
            }
        }

        if let Some(unknown) = self.tags.iter().find(|tag| !is_catalog_tag(tag)) {
            return Err(JournalError::Validation(format!("unknown tag `{unknown}`")));
        }

        Ok(())
    }

    /// Build a new record, dating it `today` when no date was given.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] when [`DreamDraft::validate`] fails.
    pub fn into_new_record(self, id: DreamId, today: Date) -> Result<DreamRecord, JournalError> {
        self.validate()?;
        let date = self.date.clone().unwrap_or_else(|| format_calendar_date(today));
        Ok(self.into_record(id, date))
    }

    /// Build the replacement for an existing record. Edits must carry a date.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] when the date is missing or validation fails.
    pub fn into_edited_record(self, id: DreamId) -> Result<DreamRecord, JournalError> {
        self.validate()?;
        let Some(date) = self.date.clone() else {
            return Err(JournalError::Validation(
                "date MUST be provided as YYYY-MM-DD when editing".to_string(),
            ));
        };
        Ok(self.into_record(id, date))
    }

    fn into_record(self, id: DreamId, date: String) -> DreamRecord {
        let mut tags = Vec::new();
        for tag in self.tags {
            let tag = catalog_tag(&tag).map_or(tag, str::to_string);
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        DreamRecord {
            id,
            hashtags: extract_hashtags(&self.text),
            text: self.text,
            date: Some(date),
            is_lucid: self.is_lucid,
            tags,
            location: self.location,
            characters: self.characters,
            emotion: self.emotion,
            intensity: self.intensity,
            clarity: self.clarity,
            sleep_quality: self.sleep_quality,
        }
    }
}

#[must_use]
pub fn find_dream<'a>(dreams: &'a [DreamRecord], id: &DreamId) -> Option<&'a DreamRecord> {
    dreams.iter().find(|dream| &dream.id == id)
}

/// Append a record to the collection.
///
/// # Errors
/// Returns [`JournalError::Duplicate`] when the id is already present.
pub fn insert_dream(dreams: &mut Vec<DreamRecord>, record: DreamRecord) -> Result<(), JournalError> {
    if find_dream(dreams, &record.id).is_some() {
        return Err(JournalError::Duplicate(record.id.to_string()));
    }
    dreams.push(record);
    Ok(())
}

/// Replace the record sharing `record.id`, returning the previous version.
/// The stored id keeps its original encoding.
///
/// # Errors
/// Returns [`JournalError::NotFound`] when no record has that id.
pub fn replace_dream(
    dreams: &mut [DreamRecord],
    mut record: DreamRecord,
) -> Result<DreamRecord, JournalError> {
    let Some(slot) = dreams.iter_mut().find(|dream| dream.id == record.id) else {
        return Err(JournalError::NotFound(record.id.to_string()));
    };
    record.id = slot.id.clone();
    Ok(std::mem::replace(slot, record))
}

/// Remove the record with `id`, keeping the relative order of the rest.
///
/// # Errors
/// Returns [`JournalError::NotFound`] when no record has that id.
pub fn remove_dream(dreams: &mut Vec<DreamRecord>, id: &DreamId) -> Result<DreamRecord, JournalError> {
    let Some(index) = dreams.iter().position(|dream| &dream.id == id) else {
        return Err(JournalError::NotFound(id.to_string()));
    };
    Ok(dreams.remove(index))
}

/// Ids appearing more than once, sorted.
#[must_use]
pub fn duplicate_ids(dreams: &[DreamRecord]) -> Vec<DreamId> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for dream in dreams {
        if !seen.insert(&dream.id) {
            duplicates.insert(dream.id.clone());
        }
    }
    duplicates.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Optional predicates over a dream collection. `None` means no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DreamFilter {
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub characters: Option<String>,
    #[serde(default)]
    pub is_lucid: Option<bool>,
    #[serde(default)]
    pub intensity: Option<i32>,
    #[serde(default)]
    pub clarity: Option<i32>,
    #[serde(default)]
    pub sleep_quality: Option<i32>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

/// Raw filter values as typed by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterInput {
    pub emotion: String,
    pub location: String,
    pub characters: String,
    pub is_lucid: Option<bool>,
    pub intensity: String,
    pub clarity: String,
    pub sleep_quality: String,
    pub sort_order: String,
}

impl DreamFilter {
    /// Normalize raw input: empty text and malformed numbers impose no constraint.
    #[must_use]
    pub fn from_input(input: &FilterInput) -> Self {
        fn text(value: &str) -> Option<String> {
            (!value.is_empty()).then(|| value.to_string())
        }

        Self {
            emotion: text(&input.emotion),
            location: text(&input.location),
            characters: text(&input.characters),
            is_lucid: input.is_lucid,
            intensity: parse_rating(&input.intensity),
            clarity: parse_rating(&input.clarity),
            sleep_quality: parse_rating(&input.sleep_quality),
            sort_order: SortOrder::parse(&input.sort_order).unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.emotion.is_none()
            && self.location.is_none()
            && self.characters.is_none()
            && self.is_lucid.is_none()
            && self.intensity.is_none()
            && self.clarity.is_none()
            && self.sleep_quality.is_none()
    }

    #[must_use]
    pub fn matches(&self, dream: &DreamRecord) -> bool {
        fn text_matches(expected: Option<&String>, actual: &str) -> bool {
            match expected {
                None => true,
                Some(value) => value.to_lowercase() == actual.to_lowercase(),
            }
        }

        fn value_matches<T: PartialEq>(expected: Option<T>, actual: T) -> bool {
            match expected {
                None => true,
                Some(value) => value == actual,
            }
        }

        text_matches(self.emotion.as_ref(), &dream.emotion)
            && text_matches(self.location.as_ref(), &dream.location)
            && text_matches(self.characters.as_ref(), &dream.characters)
            && value_matches(self.is_lucid, dream.is_lucid)
            && value_matches(self.intensity, dream.intensity)
            && value_matches(self.clarity, dream.clarity)
            && value_matches(self.sleep_quality, dream.sleep_quality)
    }
}

/// Records satisfying every constraint of `filter`, in input order.
#[must_use]
pub fn filter_dreams(dreams: &[DreamRecord], filter: &DreamFilter) -> Vec<DreamRecord> {
    dreams.iter().filter(|dream| filter.matches(dream)).cloned().collect()
}

fn compare_dates(lhs: &DreamRecord, rhs: &DreamRecord, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Asc => lhs.sort_key().cmp(&rhs.sort_key()),
        SortOrder::Desc => rhs.sort_key().cmp(&lhs.sort_key()),
    }
}

/// Order records by date; absent or malformed dates sort as [`EPOCH_DATE`].
#[must_use]
pub fn sort_dreams(dreams: &[DreamRecord], order: SortOrder) -> Vec<DreamRecord> {
    let mut sorted = dreams.to_vec();
    sorted.sort_by(|lhs, rhs| compare_dates(lhs, rhs, order));
    sorted
}

/// Filter then sort, as presented in the dream list.
#[must_use]
pub fn run_query(dreams: &[DreamRecord], filter: &DreamFilter) -> Vec<DreamRecord> {
    let mut selected = filter_dreams(dreams, filter);
    selected.sort_by(|lhs, rhs| compare_dates(lhs, rhs, filter.sort_order));
    selected
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DreamStats {
    pub total_dreams: usize,
    pub lucid_dreams: usize,
    pub average_intensity: f64,
    pub average_clarity: f64,
    pub average_sleep_quality: f64,
}

#[must_use]
pub fn aggregate(dreams: &[DreamRecord]) -> DreamStats {
    let total_dreams = dreams.len();
    if total_dreams == 0 {
        return DreamStats::default();
    }

    let mut intensity = 0.0_f64;
    let mut clarity = 0.0_f64;
    let mut sleep_quality = 0.0_f64;
    let mut lucid_dreams = 0_usize;
    for dream in dreams {
        intensity += f64::from(dream.intensity);
        clarity += f64::from(dream.clarity);
        sleep_quality += f64::from(dream.sleep_quality);
        if dream.is_lucid {
            lucid_dreams += 1;
        }
    }

    let count = f64::from(u32::try_from(total_dreams).unwrap_or(u32::MAX));
    DreamStats {
        total_dreams,
        lucid_dreams,
        average_intensity: intensity / count,
        average_clarity: clarity / count,
        average_sleep_quality: sleep_quality / count,
    }
}
