//! Turns fetcher output lines into [`Progress`] updates.
//!
//! Every line is run through one ordered rule table. Rules are grouped into categories and
//! at most one rule per category applies to a line: the first whose pattern matches and whose
//! handler accepts the captures. Categories are independent, so a single line can move the
//! percentage, name a completed file and set the last-activity text at once.
//!
//! Completed-file detection is inferred from free text and is best effort. Depending on the
//! order in which the fetcher prints things a file can be reported twice or not at all; the
//! case-insensitive de-duplication in [`RecentFiles`](crate::models::progress::RecentFiles)
//! absorbs the first case only.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::core::scanner::is_audio_file;
use crate::core::text::base_name;
use crate::models::progress::{Phase, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Percent,
    Counters,
    Extraction,
    CompletedFile,
    Sentinel,
    Merge,
    Destination,
    Metadata,
    Info,
    Diagnostics,
}

const CATEGORY_COUNT: usize = 10;

impl Category {
    fn index(self) -> usize {
        self as usize
    }
}

/// What a single line did beyond mutating the progress.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LineOutcome {
    pub matched: bool,
    pub playlist_finished: bool,
    pub added_files: Vec<String>,
}

#[derive(Default)]
struct LineCtx {
    activity: Option<(String, bool)>,
    playlist_finished: bool,
    candidates: Vec<String>,
}

impl LineCtx {
    fn activity(&mut self, text: String) {
        self.activity = Some((text, false));
    }

    fn pinned_activity(&mut self, text: String) {
        self.activity = Some((text, true));
    }
}

type Handler = fn(&mut Progress, &Captures, &mut LineCtx) -> bool;

struct Rule {
    category: Category,
    pattern: Regex,
    handler: Handler,
}

fn rule(category: Category, pattern: &str, handler: Handler) -> Rule {
    Rule {
        category,
        pattern: Regex::new(pattern).unwrap(),
        handler,
    }
}

const PCT: &str = r"(\d+(?:\.\d+)?)%";

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(Category::Percent, &format!(r"^download:\s*{PCT}\s*(.*)$"), on_template_progress),
        rule(Category::Percent, &format!(r"^\s*{PCT}\s+(.+)$"), on_bare_progress),
        rule(
            Category::Percent,
            &format!(r"\[download\]\s+{PCT}\s+of\s+~?\s*(\S+)\s+at\s+(\S+)\s+ETA\s+(\S+)"),
            on_full_progress,
        ),
        rule(
            Category::Percent,
            &format!(r"\[download\]\s+{PCT}\s+of\s+~?\s*(\S+)\s+at\s+(\S+)"),
            on_sized_progress,
        ),
        rule(Category::Counters, r"\[download\] Downloading item (\d+) of (\d+)", on_item),
        rule(
            Category::Counters,
            r"^\[[^\]]+\] (?:Playlist )?(.+?): Downloading (\d+) items",
            on_playlist,
        ),
        rule(Category::Extraction, r"^\[[^\]]+\] Extracting URL: (.+)$", on_extracting),
        rule(Category::Extraction, r"^\[([^\]]+)\] ([^:]+): (.*)$", on_extractor_banner),
        rule(
            Category::CompletedFile,
            r"^\[download\] (.+) has already been downloaded",
            on_already_downloaded,
        ),
        rule(
            Category::CompletedFile,
            r#"^\[(?:Merger|ffmpeg)\] Merging formats into "(.+)""#,
            on_merge_output,
        ),
        rule(Category::Sentinel, r"\[download\] Finished downloading playlist", on_playlist_finished),
        rule(
            Category::Sentinel,
            r"^\[download\]\s+100(?:\.0+)?% of\s+~?\s*(\S+) in \d+:\d+",
            on_file_finished,
        ),
        rule(Category::Merge, r#"^\[(?:Merger|ffmpeg)\] Merging formats into "(.+)""#, on_merging),
        rule(Category::Destination, r"^\[download\] Destination: (.+)$", on_destination),
        rule(
            Category::Metadata,
            r"^\[info\] (?i:(duration|uploader|view_count)):\s*(.+)$",
            on_metadata,
        ),
        rule(Category::Metadata, r"^\[info\] Writing video thumbnail .*?to: (.+)$", on_thumbnail),
        rule(Category::Info, r"^\[info\] ([^:\s]+): Downloading \d+ format\(s\)", on_formats),
        rule(Category::Info, r"^\[info\] ([^:\s]+): (.+)$", on_info_title),
        rule(Category::Diagnostics, r"ERROR: (.*)$", on_error),
        rule(Category::Diagnostics, r"WARNING: (.*)$", on_warning),
    ]
});

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+:\d+:\d+|\d+:\d+)").unwrap());

/// Tool tags whose `key: value` lines are post-processing, not extraction.
const NON_EXTRACTOR_TAGS: &[&str] = &[
    "download",
    "Merger",
    "ffmpeg",
    "ExtractAudio",
    "FixupM4a",
    "MoveFiles",
    "EmbedThumbnail",
    "Metadata",
];

const METADATA_KEYS: &[&str] = &["duration", "uploader", "view_count"];

/// Applies one already-sanitized output line to `progress`.
pub fn apply_line(progress: &mut Progress, line: &str) -> LineOutcome {
    let mut outcome = LineOutcome::default();
    if line.trim().is_empty() {
        return outcome;
    }

    let mut ctx = LineCtx::default();
    let mut done = [false; CATEGORY_COUNT];

    for rule in RULES.iter() {
        let slot = rule.category.index();
        if done[slot] {
            continue;
        }
        let Some(caps) = rule.pattern.captures(line) else {
            continue;
        };
        if (rule.handler)(progress, &caps, &mut ctx) {
            done[slot] = true;
            outcome.matched = true;
        }
    }

    if !outcome.matched {
        tracing::trace!("Unrecognised output line: {}", line);
    }

    for candidate in ctx.candidates.drain(..) {
        let name = base_name(&candidate);
        if !is_audio_file(name) {
            tracing::debug!("Ignoring non-audio file {}", name);
            continue;
        }
        if progress.completed_files.push(name) {
            tracing::debug!("Completed file {} ({} listed)", name, progress.completed_files.len());
            outcome.added_files.push(name.to_string());
        }
    }

    match ctx.activity.take() {
        Some((text, pinned)) => progress.set_activity(text, pinned),
        None if !progress.activity_pinned => progress.last_activity = line.to_string(),
        None => {}
    }

    outcome.playlist_finished = ctx.playlist_finished;
    outcome
}

fn parse_pct(caps: &Captures, i: usize) -> Option<f64> {
    caps.get(i)?.as_str().parse::<f64>().ok()
}

fn capture(caps: &Captures, i: usize) -> Option<String> {
    caps.get(i).map(|m| m.as_str().trim().to_string())
}

struct PercentUpdate {
    file_progress: f64,
    speed: Option<String>,
    eta: Option<String>,
    size: Option<String>,
}

fn apply_percent(p: &mut Progress, update: PercentUpdate, ctx: &mut LineCtx) -> bool {
    let overall = p.set_file_progress(update.file_progress);
    let file_progress = p.file_progress;

    if let Some(size) = update.size {
        p.file_size = size;
    }

    if !p.phase.is_sticky() {
        if let Some(speed) = update.speed {
            p.speed = speed;
        }
        if let Some(eta) = update.eta {
            p.eta = eta;
        }
        p.status = if p.is_multi_item() {
            format!("Overall {:.1}% (current file {:.1}%)", overall, file_progress)
        } else {
            format!("Downloading: {:.1}%", file_progress)
        };
        p.phase = Phase::Downloading;
    }

    if file_progress >= 100.0 && !p.current_file.is_empty() {
        ctx.candidates.push(p.current_file.clone());
    }
    true
}

fn on_template_progress(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let Some(file_progress) = parse_pct(caps, 1) else {
        return false;
    };
    let speed = capture(caps, 2).filter(|s| !s.is_empty());
    apply_percent(
        p,
        PercentUpdate {
            file_progress,
            speed,
            eta: None,
            size: None,
        },
        ctx,
    )
}

fn on_bare_progress(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let Some(file_progress) = parse_pct(caps, 1) else {
        return false;
    };
    apply_percent(
        p,
        PercentUpdate {
            file_progress,
            speed: capture(caps, 2),
            eta: None,
            size: None,
        },
        ctx,
    )
}

fn on_full_progress(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let Some(file_progress) = parse_pct(caps, 1) else {
        return false;
    };
    apply_percent(
        p,
        PercentUpdate {
            file_progress,
            size: capture(caps, 2),
            speed: capture(caps, 3),
            eta: capture(caps, 4),
        },
        ctx,
    )
}

fn on_sized_progress(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let Some(file_progress) = parse_pct(caps, 1) else {
        return false;
    };
    apply_percent(
        p,
        PercentUpdate {
            file_progress,
            size: capture(caps, 2),
            speed: capture(caps, 3),
            eta: None,
        },
        ctx,
    )
}

/// A new file begins: sticky phases from the previous file no longer apply.
fn begin_file(p: &mut Progress) {
    p.set_file_progress(0.0);
    p.phase = Phase::Downloading;
}

fn on_item(p: &mut Progress, caps: &Captures, _ctx: &mut LineCtx) -> bool {
    let (Ok(current), Ok(total)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
        return false;
    };
    p.current_index = current;
    p.total_count = total;
    begin_file(p);
    p.status = format!("Downloading item {}/{}", current, total);
    true
}

fn on_playlist(p: &mut Progress, caps: &Captures, _ctx: &mut LineCtx) -> bool {
    let Ok(total) = caps[2].parse::<u32>() else {
        return false;
    };
    let title = caps[1].trim().to_string();
    p.total_count = total;
    p.status = format!("Playlist: {} ({} items)", title, total);
    p.playlist_title = title;
    p.phase = Phase::Extracting;
    true
}

fn on_extracting(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    p.status = "Extracting media information...".into();
    p.phase = Phase::Extracting;
    ctx.activity(format!("Extracting: {}", caps[1].trim()));
    true
}

fn on_extractor_banner(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let tag = &caps[1];
    if NON_EXTRACTOR_TAGS.contains(&tag) {
        return false;
    }
    p.phase = Phase::Extracting;
    ctx.activity(format!("[{}] {}: {}", tag, &caps[2], &caps[3]));
    true
}

fn on_already_downloaded(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let path = caps[1].trim().to_string();
    p.speed = "skipped".into();
    p.status = format!("Skipping already downloaded file: {}", base_name(&path));
    p.phase = Phase::Skipped;
    ctx.candidates.push(path);
    true
}

fn on_merge_output(_p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    ctx.candidates.push(caps[1].to_string());
    true
}

fn on_playlist_finished(p: &mut Progress, _caps: &Captures, ctx: &mut LineCtx) -> bool {
    p.progress = 100.0;
    p.file_progress = 100.0;
    p.status = "Download complete".into();
    p.phase = Phase::Completed;
    p.is_downloading = false;
    ctx.playlist_finished = true;
    true
}

fn on_file_finished(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    p.set_file_progress(100.0);
    if let Some(size) = capture(caps, 1) {
        p.file_size = size;
    }
    if !p.is_multi_item() {
        p.status = "Download complete".into();
        p.phase = Phase::Completed;
    } else if !p.phase.is_sticky() {
        p.status = "File complete".into();
        p.phase = Phase::Downloading;
    }
    if !p.current_file.is_empty() {
        ctx.candidates.push(p.current_file.clone());
    }
    true
}

fn on_merging(p: &mut Progress, caps: &Captures, _ctx: &mut LineCtx) -> bool {
    p.status = format!("Merging: {}", base_name(&caps[1]));
    p.phase = Phase::Merging;
    true
}

fn on_destination(p: &mut Progress, caps: &Captures, _ctx: &mut LineCtx) -> bool {
    let path = caps[1].trim().to_string();
    let name = base_name(&path).to_string();
    begin_file(p);
    p.status = format!("Downloading: {}", name);
    p.current_title = name;
    p.current_file = path;
    true
}

fn on_metadata(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let value = caps[2].trim();
    match caps[1].to_ascii_lowercase().as_str() {
        "duration" => {
            let Some(m) = DURATION_RE.captures(value) else {
                return false;
            };
            p.duration = m[1].to_string();
            ctx.pinned_activity(format!("Duration: {}", p.duration));
        }
        "uploader" => {
            p.uploader = value.to_string();
            ctx.pinned_activity(format!("Uploader: {}", p.uploader));
        }
        "view_count" => {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return false;
            }
            p.view_count = value.to_string();
            ctx.pinned_activity(format!("Views: {}", p.view_count));
        }
        _ => return false,
    }
    true
}

fn on_thumbnail(p: &mut Progress, caps: &Captures, _ctx: &mut LineCtx) -> bool {
    p.thumbnail = caps[1].trim().to_string();
    true
}

fn on_formats(p: &mut Progress, caps: &Captures, _ctx: &mut LineCtx) -> bool {
    let id = caps[1].to_string();
    p.status = format!("Preparing: {}", id);
    p.current_title = id;
    true
}

fn on_info_title(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let key = &caps[1];
    if METADATA_KEYS.iter().any(|k| key.eq_ignore_ascii_case(k)) {
        return false;
    }
    p.current_title = key.to_string();
    ctx.activity(format!("Title: {} - {}", key, caps[2].trim()));
    true
}

fn on_error(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let message = caps[1].trim().to_string();
    p.status = format!("Error: {}", message);
    p.phase = Phase::Error;
    ctx.pinned_activity(format!("ERROR: {}", message));
    p.error_message = message;
    true
}

fn on_warning(p: &mut Progress, caps: &Captures, ctx: &mut LineCtx) -> bool {
    let message = caps[1].trim().to_string();
    ctx.pinned_activity(format!("WARNING: {}", message));
    p.warning_message = message;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(p: &mut Progress, lines: &[&str]) -> Vec<LineOutcome> {
        lines.iter().map(|l| apply_line(p, l)).collect()
    }

    #[test]
    fn template_progress_sets_speed_and_phase() {
        let mut p = Progress::starting();
        apply_line(&mut p, "download: 42.5%   1.20MiB/s");
        assert_eq!(p.file_progress, 42.5);
        assert_eq!(p.progress, 42.5);
        assert_eq!(p.speed, "1.20MiB/s");
        assert_eq!(p.phase, Phase::Downloading);
        assert_eq!(p.status, "Downloading: 42.5%");
    }

    #[test]
    fn full_progress_line_fills_size_and_eta() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[download]  50.0% of 10.50MiB at 1.20MiB/s ETA 00:05");
        assert_eq!(p.file_progress, 50.0);
        assert_eq!(p.file_size, "10.50MiB");
        assert_eq!(p.speed, "1.20MiB/s");
        assert_eq!(p.eta, "00:05");
    }

    #[test]
    fn sized_progress_without_eta() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[download]  12.0% of ~ 3.00MiB at 500.00KiB/s");
        assert_eq!(p.file_progress, 12.0);
        assert_eq!(p.file_size, "3.00MiB");
        assert_eq!(p.speed, "500.00KiB/s");
        assert_eq!(p.eta, "");
    }

    #[test]
    fn playlist_item_drives_overall_progress() {
        let mut p = Progress::starting();
        feed(
            &mut p,
            &[
                "[download] Downloading item 3 of 10",
                "download: 40.0% 2.00MiB/s",
            ],
        );
        assert_eq!(p.current_index, 3);
        assert_eq!(p.total_count, 10);
        assert!((p.progress - 24.0).abs() < 1e-9);
        assert_eq!(p.status, "Overall 24.0% (current file 40.0%)");
    }

    #[test]
    fn playlist_banner_sets_title_and_total() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[BiliBili] Playlist Three Body: Downloading 12 items of 12");
        assert_eq!(p.playlist_title, "Three Body");
        assert_eq!(p.total_count, 12);
        assert_eq!(p.phase, Phase::Extracting);
    }

    #[test]
    fn extracting_url_sets_activity() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[generic] Extracting URL: https://example.com/a");
        assert_eq!(p.phase, Phase::Extracting);
        assert_eq!(p.last_activity, "Extracting: https://example.com/a");
    }

    #[test]
    fn extractor_banner_ignores_download_lines() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[youtube] abc123: Downloading webpage");
        assert_eq!(p.phase, Phase::Extracting);
        assert_eq!(p.last_activity, "[youtube] abc123: Downloading webpage");

        apply_line(&mut p, "[download] Destination: /lib/book/01.m4a");
        assert_eq!(p.phase, Phase::Downloading);
        assert_eq!(p.current_file, "/lib/book/01.m4a");
        assert_eq!(p.current_title, "01.m4a");
    }

    #[test]
    fn already_downloaded_is_sticky_against_bare_percent() {
        let mut p = Progress::starting();
        let out = apply_line(&mut p, "[download] /lib/book/01.m4a has already been downloaded");
        assert_eq!(p.phase, Phase::Skipped);
        assert_eq!(out.added_files, vec!["01.m4a".to_string()]);

        apply_line(&mut p, "100.0%  Unknown B/s");
        assert_eq!(p.phase, Phase::Skipped);
        assert_eq!(p.speed, "skipped");
        assert_eq!(p.file_progress, 100.0);
        assert_eq!(p.completed_files.len(), 1);
    }

    #[test]
    fn next_file_clears_skipped() {
        let mut p = Progress::starting();
        feed(
            &mut p,
            &[
                "[download] 01.m4a has already been downloaded",
                "[download] Downloading item 2 of 4",
                "download: 10.0% 1.00MiB/s",
            ],
        );
        assert_eq!(p.phase, Phase::Downloading);
        assert_eq!(p.speed, "1.00MiB/s");
    }

    #[test]
    fn error_phase_survives_following_percent() {
        let mut p = Progress::starting();
        feed(
            &mut p,
            &["ERROR: [youtube] x: Video unavailable", "download: 5.0% 1.00KiB/s"],
        );
        assert_eq!(p.phase, Phase::Error);
        assert_eq!(p.error_message, "[youtube] x: Video unavailable");
        assert_eq!(p.last_activity, "ERROR: [youtube] x: Video unavailable");
    }

    #[test]
    fn non_audio_candidates_are_dropped() {
        let mut p = Progress::starting();
        let out = apply_line(&mut p, "[download] cover.jpg has already been downloaded");
        assert!(out.added_files.is_empty());
        assert!(p.completed_files.is_empty());
    }

    #[test]
    fn merge_line_completes_file_and_sets_phase() {
        let mut p = Progress::starting();
        let out = apply_line(&mut p, r#"[Merger] Merging formats into "/lib/book/Talk.webm""#);
        assert_eq!(out.added_files, vec!["Talk.webm".to_string()]);
        assert_eq!(p.phase, Phase::Merging);
        assert_eq!(p.status, "Merging: Talk.webm");
    }

    #[test]
    fn hundred_percent_completes_current_file_once() {
        let mut p = Progress::starting();
        let outs = feed(
            &mut p,
            &[
                "[download] Destination: /lib/book/02.M4A",
                "download: 100.0% 2.00MiB/s",
                "[download] 100% of 4.00MiB in 00:00:02",
            ],
        );
        assert_eq!(outs[1].added_files, vec!["02.M4A".to_string()]);
        assert!(outs[2].added_files.is_empty());
        assert_eq!(p.completed_files.as_slice(), ["02.M4A"]);
        assert_eq!(p.phase, Phase::Completed);
        assert_eq!(p.file_size, "4.00MiB");
    }

    #[test]
    fn completed_list_keeps_three_newest() {
        let mut p = Progress::starting();
        for i in 1..=5 {
            apply_line(&mut p, &format!("[download] {:02}.mp3 has already been downloaded", i));
        }
        assert_eq!(p.completed_files.as_slice(), ["03.mp3", "04.mp3", "05.mp3"]);
    }

    #[test]
    fn playlist_finished_forces_completion_without_new_file() {
        let mut p = Progress::starting();
        feed(&mut p, &["[download] Downloading item 4 of 4", "download: 60.0% 1.00MiB/s"]);
        let out = apply_line(&mut p, "[download] Finished downloading playlist: Three Body");
        assert!(out.playlist_finished);
        assert!(out.added_files.is_empty());
        assert_eq!(p.progress, 100.0);
        assert_eq!(p.phase, Phase::Completed);
        assert!(!p.is_downloading);
    }

    #[test]
    fn metadata_pins_activity() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[info] duration: 1:02:03");
        assert_eq!(p.duration, "1:02:03");
        assert_eq!(p.last_activity, "Duration: 1:02:03");
        assert_eq!(p.current_title, "");

        apply_line(&mut p, "some unrelated chatter");
        assert_eq!(p.last_activity, "Duration: 1:02:03");

        apply_line(&mut p, "[generic] Extracting URL: https://example.com");
        assert_eq!(p.last_activity, "Extracting: https://example.com");
        apply_line(&mut p, "more chatter");
        assert_eq!(p.last_activity, "more chatter");
    }

    #[test]
    fn malformed_metadata_is_skipped() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[info] view_count: lots");
        assert_eq!(p.view_count, "");
        apply_line(&mut p, "[info] view_count: 1234");
        assert_eq!(p.view_count, "1234");
    }

    #[test]
    fn info_lines_set_current_title() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[info] BV1xx411c7mD: Downloading 1 format(s): 30280");
        assert_eq!(p.current_title, "BV1xx411c7mD");
        assert_eq!(p.status, "Preparing: BV1xx411c7mD");
    }

    #[test]
    fn thumbnail_path_is_recorded() {
        let mut p = Progress::starting();
        apply_line(&mut p, "[info] Writing video thumbnail original to: /lib/book/01.jpg");
        assert_eq!(p.thumbnail, "/lib/book/01.jpg");
        assert_eq!(p.current_title, "");
    }

    #[test]
    fn warning_keeps_phase() {
        let mut p = Progress::starting();
        apply_line(&mut p, "download: 10.0% 1.00MiB/s");
        apply_line(&mut p, "WARNING: unable to extract chapters");
        assert_eq!(p.phase, Phase::Downloading);
        assert_eq!(p.warning_message, "unable to extract chapters");
    }

    #[test]
    fn unmatched_and_empty_lines() {
        let mut p = Progress::starting();
        let out = apply_line(&mut p, "just noise");
        assert!(!out.matched);
        assert_eq!(p.last_activity, "just noise");

        let out = apply_line(&mut p, "   ");
        assert!(!out.matched);
        assert_eq!(p.last_activity, "just noise");
    }

    #[test]
    fn overall_never_exceeds_hundred() {
        let mut p = Progress::starting();
        feed(&mut p, &["[download] Downloading item 5 of 4", "download: 100.0% 1MiB/s"]);
        assert_eq!(p.progress, 100.0);
    }
}
