use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use url::Url;

use crate::domain::monthly::{id_of_month, MonthlyStoryCount};
use crate::domain::text::{story_image_count, story_link_count, story_url_count};

/// Host-suffix matcher compiled from a newline-separated suffix list.
/// `qq.com` matches `qq.com` and any subdomain of it.
#[derive(Debug, Clone)]
pub struct UrlBlacklist {
    suffixes: Vec<String>,
}

impl UrlBlacklist {
    pub fn compile(text: &str) -> Self {
        let suffixes = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_ascii_lowercase())
            .collect();
        Self { suffixes }
    }

    pub fn is_match(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.suffixes
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
    }
}

/// Hosts whose feeds are known to carry full content already; per-story
/// webpage fetching is skipped for them.
const FULL_CONTENT_HOSTS: &str = "
v2ex.com
news.ycombinator.com
github.com
pypi.org
";

static FULL_CONTENT_BLACKLIST: LazyLock<UrlBlacklist> =
    LazyLock::new(|| UrlBlacklist::compile(FULL_CONTENT_HOSTS));

pub fn is_feed_need_fetch_storys(feed_url: &str) -> bool {
    !FULL_CONTENT_BLACKLIST.is_match(feed_url)
}

/// News-like cadence classifier, used as a proxy for "this feed's RSS is
/// likely full-text". Looks at the 18 monthly buckets ending at `date`'s
/// month: productive when the recent 3-month peak or the 18-month mean of
/// non-zero months reaches one story per day. Feeds with no signal at all
/// are treated as productive.
pub fn is_productive_feed(monthly_story_count: &MonthlyStoryCount, date: DateTime<Utc>) -> bool {
    let (year, month) = (date.year(), date.month());
    if !(1970..=9999).contains(&year) {
        return true;
    }
    let month_id = id_of_month(year, month);

    // Oldest first, so the last three entries are the most recent months.
    let mut count_18m = [0i64; 18];
    for (i, slot) in count_18m.iter_mut().rev().enumerate() {
        *slot = monthly_story_count.get_by_id((month_id - i as i64).max(0));
    }
    if count_18m.iter().sum::<i64>() <= 0 {
        return true;
    }

    let freq_3m = *count_18m[15..].iter().max().unwrap() as f64 / 30.0;
    let non_zero: Vec<i64> = count_18m.iter().copied().filter(|&c| c > 0).collect();
    let freq_18m = non_zero.iter().sum::<i64>() as f64 / non_zero.len() as f64 / 30.0;

    freq_3m.max(freq_18m) >= 1.0
}

/// Detect whether the full content is already in the rss feed, so fetching
/// the story webpage can be skipped.
pub fn is_fulltext_story(
    monthly_story_count: &MonthlyStoryCount,
    content: Option<&str>,
    dt_published: Option<DateTime<Utc>>,
) -> bool {
    let Some(content) = content.filter(|c| !c.is_empty()) else {
        return false;
    };
    if content.chars().count() >= 2000 {
        return true;
    }
    let Some(dt_published) = dt_published else {
        return true;
    };
    if is_productive_feed(monthly_story_count, dt_published) {
        return true;
    }
    if story_link_count(content) >= 2 {
        return true;
    }
    if story_url_count(content) >= 3 {
        return true;
    }
    story_image_count(content) >= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(year: i32, month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_blacklist_matches_host_and_subdomains() {
        let blacklist = UrlBlacklist::compile("qpic.cn\nqq.com\n");
        assert!(blacklist.is_match("https://x.qpic.cn/a.jpg"));
        assert!(blacklist.is_match("https://qq.com/"));
        assert!(blacklist.is_match("https://mp.weixin.qq.com/feed"));
        assert!(!blacklist.is_match("https://notqq.com/"));
        assert!(!blacklist.is_match("not a url"));
    }

    #[test]
    fn test_full_content_hosts_skip_story_fetch() {
        assert!(!is_feed_need_fetch_storys("https://www.v2ex.com/index.xml"));
        assert!(!is_feed_need_fetch_storys("https://news.ycombinator.com/rss"));
        assert!(!is_feed_need_fetch_storys("https://github.com/rust-lang/rust/releases.atom"));
        assert!(!is_feed_need_fetch_storys("https://pypi.org/rss/updates.xml"));
        assert!(is_feed_need_fetch_storys("https://example.com/feed"));
    }

    #[test]
    fn test_empty_counts_is_productive() {
        let counts = MonthlyStoryCount::new();
        assert!(is_productive_feed(&counts, date(2024, 1)));
    }

    #[test]
    fn test_daily_feed_is_productive() {
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2024, 1), 60);
        assert!(is_productive_feed(&counts, date(2024, 1)));
    }

    #[test]
    fn test_sparse_feed_is_not_productive() {
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2023, 11), 2);
        counts.put(id_of_month(2024, 1), 3);
        assert!(!is_productive_feed(&counts, date(2024, 1)));
    }

    #[test]
    fn test_old_burst_outside_window_is_ignored() {
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2020, 1), 500);
        counts.put(id_of_month(2024, 1), 1);
        assert!(!is_productive_feed(&counts, date(2024, 1)));
    }

    #[test]
    fn test_fulltext_no_content_is_false() {
        let counts = MonthlyStoryCount::new();
        assert!(!is_fulltext_story(&counts, None, Some(date(2024, 1))));
        assert!(!is_fulltext_story(&counts, Some(""), Some(date(2024, 1))));
    }

    #[test]
    fn test_fulltext_long_content_is_true() {
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2024, 1), 1);
        let long = "x".repeat(2000);
        assert!(is_fulltext_story(&counts, Some(&long), Some(date(2024, 1))));
    }

    #[test]
    fn test_fulltext_missing_published_date_is_true() {
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2024, 1), 1);
        assert!(is_fulltext_story(&counts, Some("short"), None));
    }

    #[test]
    fn test_fulltext_productive_feed_short_prose() {
        // A feed posting 60 storys a month is classified full-text even for
        // a 200-char story with no links.
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2024, 1), 60);
        let prose = "word ".repeat(40);
        assert!(is_fulltext_story(&counts, Some(&prose), Some(date(2024, 1))));
    }

    #[test]
    fn test_fulltext_link_and_image_ladders() {
        let mut counts = MonthlyStoryCount::new();
        counts.put(id_of_month(2024, 1), 1);
        let published = Some(date(2024, 1));

        let two_links = r#"<a href="https://a">a</a><a href="https://b">b</a>"#;
        assert!(is_fulltext_story(&counts, Some(two_links), published));

        let three_urls = "see https://a.example https://b.example https://c.example";
        assert!(is_fulltext_story(&counts, Some(three_urls), published));

        let image = r#"text <img src="https://x/a.png">"#;
        assert!(is_fulltext_story(&counts, Some(image), published));

        assert!(!is_fulltext_story(&counts, Some("plain short text"), published));
    }
}
