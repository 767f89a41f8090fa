//! Game-log tailing.
//!
//! The game appends to one large text log. Each poll rescans the file in a
//! single buffered pass, counts lines, tracks the most recent logged-in
//! character and keeps only new lines carrying a known event marker, so the
//! parser downstream sees a small fraction of the raw log.
//!
//! Optionally the same pass collects one [`RawLogPattern`] per distinct line
//! shape (event name, severity, team and subsystem tags), which lets a host
//! discover event types the marker list does not know yet.
//!
//! ```text
//! <2025-05-01T20:01:00.000Z> [Notice] <EquipItem> [Team_Actor][Inventory] ...
//!  └─ timestamp (stripped)   └─ severity └─ event name  └─ team  └─ subsystem
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Substrings that mark a line worth parsing.
pub const EVENT_MARKERS: &[&str] = &[
    LOGIN_MARKER,
    "<RequestLocationInventory>",
    "<EquipItem>",
    "<AttachmentReceived>",
    "<Vehicle Control Flow>",
    "<[ActorState] Place>",
    "<Quantum Drive Arrived",
    "<Jump Drive Requesting State Change>",
    "Destruction>",
    "<Actor Death>",
    "<[ActorState] Dead>",
    "<FatalCollision>",
    "<[STAMINA]",
    "<MissionShared>",
    "<ObjectiveUpserted>",
    "<MissionEnded>",
    "<EndMission>",
    "<CLocalMissionPhaseMarker::CreateMarker>",
    "<CEntityComponentShoppingProvider::SendStandardItemBuyRequest>",
    "<CWallet::ProcessClaimToNextStep>",
    "<CLandingArea::OnDoorOpenStateChanged>",
    "<CSCItemDockingTube::OnSetTubeState>",
    "<CSCLoadingPlatformManager>",
    "<Spawn Flow>",
    "<CEntity::OnOwnerRemoved>",
    "<SystemQuit>",
    "<Failed to get starmap route data!>",
];

const LOGIN_MARKER: &str = "AccountLoginCharacterStatus_Character";

pub fn contains_event_marker(line: &str) -> bool {
    EVENT_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Character name from a login line: the text after `name ` up to ` - `.
pub fn parse_player_name(line: &str) -> Option<&str> {
    if !line.contains(LOGIN_MARKER) {
        return None;
    }
    let start = line.find("name ")? + "name ".len();
    let len = line[start..].find(" - ")?;
    Some(&line[start..start + len])
}

const SEVERITY_TAGS: &[&str] = &["Notice", "Error", "Trace", "Warning"];

static TIMESTAMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<\d{4}-\d{2}-\d{2}T[\d:.]+Z>\s*").expect("timestamp regex"));
static SEVERITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(Notice|Error|Trace|Warning)\]").expect("severity regex"));
static EVENT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z_:][A-Za-z0-9_:]*(?:::[A-Za-z0-9_<>]+)*)>").expect("event name regex")
});
static TEAM_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Team_([A-Za-z]+)\]").expect("team tag regex"));
static SUBSYSTEM_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z][A-Za-z0-9_]*)\]").expect("subsystem tag regex"));

/// Structural fingerprint of one timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLogPattern {
    /// First `<Name>` tag, e.g. `EquipItem` or `CWallet::ProcessClaimToNextStep`
    pub event_name: Option<String>,
    pub severity: Option<String>,
    /// `Team_*` tags, sorted
    pub teams: Vec<String>,
    /// Other bracketed tags, sorted, severities and teams excluded
    pub subsystems: Vec<String>,
    pub signature: String,
    pub example_line: String,
}

/// Dedupe key for patterns: `event|severity|teams|subsystems`, with `null`
/// for missing fields. Tag order does not matter.
pub fn pattern_signature(
    event_name: Option<&str>,
    severity: Option<&str>,
    teams: &[String],
    subsystems: &[String],
) -> String {
    let mut teams = teams.to_vec();
    teams.sort();
    let mut subsystems = subsystems.to_vec();
    subsystems.sort();
    format!(
        "{}|{}|{}|{}",
        event_name.unwrap_or("null"),
        severity.unwrap_or("null"),
        teams.join(","),
        subsystems.join(",")
    )
}

/// Pattern of `line`, or `None` unless it starts with an ISO timestamp.
pub fn extract_log_pattern(line: &str) -> Option<RawLogPattern> {
    let stamp = TIMESTAMP_RE.find(line)?;
    let content = &line[stamp.end()..];

    let severity = SEVERITY_RE.captures(content).map(|c| c[1].to_string());
    let event_name = EVENT_NAME_RE
        .captures(content)
        .map(|c| c[1].to_string())
        .filter(|name| !name.starts_with("20"));

    let teams: BTreeSet<String> = TEAM_TAG_RE
        .captures_iter(content)
        .map(|c| format!("Team_{}", &c[1]))
        .collect();
    let subsystems: BTreeSet<String> = SUBSYSTEM_TAG_RE
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .filter(|tag| !SEVERITY_TAGS.contains(&tag.as_str()) && !tag.starts_with("Team_"))
        .collect();
    let teams: Vec<String> = teams.into_iter().collect();
    let subsystems: Vec<String> = subsystems.into_iter().collect();

    Some(RawLogPattern {
        signature: pattern_signature(event_name.as_deref(), severity.as_deref(), &teams, &subsystems),
        event_name,
        severity,
        teams,
        subsystems,
        example_line: line.to_string(),
    })
}

/// Result of one [`read_log_update`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUpdate {
    /// Total lines in the file
    pub line_count: usize,
    /// Most recent character name, when requested and found
    pub player_name: Option<String>,
    /// Marker lines at index `from_line` or later
    pub new_lines: Vec<String>,
    /// First occurrence of each distinct pattern among the new lines, in
    /// file order; empty unless requested
    pub patterns: Vec<RawLogPattern>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMetadata {
    pub line_count: usize,
    pub player_name: Option<String>,
}

/// Single pass: line count, latest player name, new marker lines and,
/// with `extract_patterns`, the distinct patterns of every new line.
pub fn read_log_update(
    path: impl AsRef<Path>,
    from_line: usize,
    extract_player_name: bool,
    extract_patterns: bool,
) -> Result<LogUpdate, WatchError> {
    let mut update = LogUpdate::default();
    let mut scanned = 0usize;
    let mut signatures = HashSet::new();

    for_each_line(path.as_ref(), |index, line| {
        if extract_player_name {
            if let Some(name) = parse_player_name(&line) {
                update.player_name = Some(name.to_string());
            }
        }
        if index >= from_line {
            scanned += 1;
            if extract_patterns {
                if let Some(pattern) = extract_log_pattern(&line) {
                    if signatures.insert(pattern.signature.clone()) {
                        update.patterns.push(pattern);
                    }
                }
            }
            if contains_event_marker(&line) {
                update.new_lines.push(line);
            }
        }
        update.line_count = index + 1;
    })?;

    if scanned > 0 {
        log::trace!(
            "Scanned {scanned} new lines, {} matched event markers, {} distinct patterns",
            update.new_lines.len(),
            update.patterns.len()
        );
    }
    if scanned > 1000 && update.new_lines.is_empty() {
        log::warn!("No event markers matched in {scanned} lines; log format may have changed");
    }
    Ok(update)
}

/// Line count and latest player name.
pub fn get_log_metadata(path: impl AsRef<Path>) -> Result<LogMetadata, WatchError> {
    let update = read_log_update(path, usize::MAX, true, false)?;
    Ok(LogMetadata {
        line_count: update.line_count,
        player_name: update.player_name,
    })
}

/// Non-empty lines at index `from_line` or later, unfiltered.
pub fn read_log_lines_from(path: impl AsRef<Path>, from_line: usize) -> Result<Vec<String>, WatchError> {
    let mut lines = Vec::new();
    for_each_line(path.as_ref(), |index, line| {
        if index >= from_line && !line.trim().is_empty() {
            lines.push(line);
        }
    })?;
    Ok(lines)
}

pub fn get_line_count(path: impl AsRef<Path>) -> Result<usize, WatchError> {
    let mut count = 0;
    for_each_line(path.as_ref(), |index, _| count = index + 1)?;
    Ok(count)
}

fn for_each_line(path: &Path, mut f: impl FnMut(usize, String)) -> Result<(), WatchError> {
    let file = File::open(path).map_err(|e| WatchError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| WatchError::Read {
            line: index,
            reason: e.to_string(),
        })?;
        f(index, line);
    }
    Ok(())
}

/// Incremental reader that remembers how far it got.
#[derive(Debug, Clone)]
pub struct LogTail {
    path: PathBuf,
    next_line: usize,
    player_name: Option<String>,
}

impl LogTail {
    /// Start at the beginning of the file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            next_line: 0,
            player_name: None,
        }
    }

    /// Start after the lines already present, so only future events show up.
    pub fn from_end(path: impl Into<PathBuf>) -> Result<Self, WatchError> {
        let mut tail = Self::new(path);
        let meta = get_log_metadata(&tail.path)?;
        tail.next_line = meta.line_count;
        tail.player_name = meta.player_name;
        Ok(tail)
    }

    pub fn player_name(&self) -> Option<&str> {
        self.player_name.as_deref()
    }

    pub fn position(&self) -> usize {
        self.next_line
    }

    /// Marker lines appended since the last poll.
    ///
    /// A file that shrank (the game rotated its log) is read from the top.
    pub fn poll(&mut self) -> Result<Vec<String>, WatchError> {
        let mut update = read_log_update(&self.path, self.next_line, true, false)?;
        if update.line_count < self.next_line {
            log::info!("{} was truncated; rereading from the start", self.path.display());
            update = read_log_update(&self.path, 0, true, false)?;
        }
        self.next_line = update.line_count;
        if update.player_name.is_some() {
            self.player_name = update.player_name;
        }
        Ok(update.new_lines)
    }
}

/// Watcher errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    Open { path: PathBuf, reason: String },
    Read { line: usize, reason: String },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, reason } => write!(f, "Failed to open {}: {reason}", path.display()),
            Self::Read { line, reason } => write!(f, "Failed to read line {line}: {reason}"),
        }
    }
}

impl std::error::Error for WatchError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LOGIN: &str = "<2025-05-01T20:00:00.000Z> [Notice] <AccountLoginCharacterStatus_Character> Character: createdAt 1 - accountId 2 - name Space-Cowboy - state STATE_CURRENT";

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_player_name_keeps_hyphens() {
        assert_eq!(parse_player_name(LOGIN), Some("Space-Cowboy"));
        assert_eq!(parse_player_name("name Bob - no marker here"), None);
    }

    #[test]
    fn test_read_log_update_filters_and_counts() {
        let file = write_log(&[
            LOGIN,
            "noise",
            "<2025-05-01T20:01:00.000Z> [Notice] <Actor Death> CActor::Kill: 'PU_Pilot' killed by 'Space-Cowboy'",
            "",
            "<2025-05-01T20:02:00.000Z> [Notice] <SystemQuit> bye",
        ]);
        let update = read_log_update(file.path(), 2, true, false).unwrap();
        assert_eq!(update.line_count, 5);
        assert_eq!(update.player_name.as_deref(), Some("Space-Cowboy"));
        assert_eq!(update.new_lines.len(), 2);
        assert!(update.new_lines[0].contains("<Actor Death>"));

        let without_name = read_log_update(file.path(), 0, false, false).unwrap();
        assert_eq!(without_name.player_name, None);
        assert_eq!(without_name.new_lines.len(), 3);
        assert!(without_name.patterns.is_empty());
    }

    #[test]
    fn test_pattern_fields() {
        let line = "<2025-05-01T20:01:00.000Z> [Notice] <EquipItem> Request[3] [Team_Actor][Inventory][Team_Actor] item equipped";
        let pattern = extract_log_pattern(line).unwrap();
        assert_eq!(pattern.event_name.as_deref(), Some("EquipItem"));
        assert_eq!(pattern.severity.as_deref(), Some("Notice"));
        assert_eq!(pattern.teams, vec!["Team_Actor"]);
        assert_eq!(pattern.subsystems, vec!["Inventory"]);
        assert_eq!(pattern.signature, "EquipItem|Notice|Team_Actor|Inventory");
        assert_eq!(pattern.example_line, line);
    }

    #[test]
    fn test_pattern_needs_leading_timestamp() {
        assert_eq!(extract_log_pattern("[Notice] <EquipItem> no timestamp"), None);
        assert_eq!(extract_log_pattern(" <2025-05-01T20:01:00.000Z> [Notice] late"), None);
    }

    #[test]
    fn test_pattern_qualified_event_name_and_bare_line() {
        let shop = extract_log_pattern(
            "<2025-05-01T20:01:00.000Z> [Notice] <CWallet::ProcessClaimToNextStep> [Shop] paid",
        )
        .unwrap();
        assert_eq!(shop.event_name.as_deref(), Some("CWallet::ProcessClaimToNextStep"));

        let bare = extract_log_pattern("<2025-05-01T20:01:00.000Z> <2025-05-01> just text").unwrap();
        assert_eq!(bare.event_name, None);
        assert_eq!(bare.signature, "null|null||");
    }

    #[test]
    fn test_signature_ignores_tag_order() {
        let teams = ["Team_B".to_string(), "Team_A".to_string()];
        let subsystems = ["Zed".to_string(), "Alpha".to_string()];
        let mut reversed_teams = teams.clone();
        reversed_teams.reverse();
        assert_eq!(
            pattern_signature(Some("Event"), None, &teams, &subsystems),
            pattern_signature(Some("Event"), None, &reversed_teams, &["Alpha".to_string(), "Zed".to_string()]),
        );
        assert_eq!(pattern_signature(None, None, &[], &[]), "null|null||");
    }

    #[test]
    fn test_update_collects_distinct_patterns_from_new_lines() {
        let file = write_log(&[
            "<2025-05-01T20:00:00.000Z> [Notice] <OldEvent> before the cursor",
            "<2025-05-01T20:01:00.000Z> [Notice] <EquipItem> [Inventory] first",
            "<2025-05-01T20:01:05.000Z> [Notice] <EquipItem> [Inventory] second",
            "untimestamped chatter",
            "<2025-05-01T20:02:00.000Z> [Error] <EquipItem> [Inventory] failed",
        ]);
        let update = read_log_update(file.path(), 1, false, true).unwrap();
        let signatures: Vec<&str> = update.patterns.iter().map(|p| p.signature.as_str()).collect();
        assert_eq!(
            signatures,
            vec!["EquipItem|Notice||Inventory", "EquipItem|Error||Inventory"]
        );
        assert!(update.patterns[0].example_line.ends_with("first"));
    }

    #[test]
    fn test_pattern_serializes_camel_case() {
        let pattern = extract_log_pattern("<2025-05-01T20:01:00.000Z> [Notice] <SystemQuit> bye").unwrap();
        let json = serde_json::to_value(&pattern).unwrap();
        assert_eq!(json["eventName"], "SystemQuit");
        assert_eq!(json["exampleLine"], pattern.example_line);
    }

    #[test]
    fn test_latest_login_wins() {
        let second = LOGIN.replace("Space-Cowboy", "Alt");
        let file = write_log(&[LOGIN, &second]);
        let meta = get_log_metadata(file.path()).unwrap();
        assert_eq!(meta, LogMetadata { line_count: 2, player_name: Some("Alt".into()) });
    }

    #[test]
    fn test_read_lines_from_skips_blank() {
        let file = write_log(&["a", "  ", "b", "c"]);
        assert_eq!(read_log_lines_from(file.path(), 1).unwrap(), vec!["b", "c"]);
        assert_eq!(get_line_count(file.path()).unwrap(), 4);
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let err = get_line_count("/definitely/not/here.log").unwrap_err();
        assert!(matches!(err, WatchError::Open { .. }));
    }

    #[test]
    fn test_tail_sees_only_appended_lines() {
        let mut file = write_log(&[LOGIN, "<Actor Death> old"]);
        let mut tail = LogTail::from_end(file.path()).unwrap();
        assert_eq!(tail.player_name(), Some("Space-Cowboy"));
        assert!(tail.poll().unwrap().is_empty());

        writeln!(file, "<Actor Death> new").unwrap();
        writeln!(file, "chatter").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.poll().unwrap(), vec!["<Actor Death> new"]);
        assert_eq!(tail.position(), 4);
    }
}
