// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Trap Page Generation
//!
//! Every trap page links to a handful of further pages that do not exist,
//! so a crawler following them never runs out of work.

use std::fmt::Write;
use std::ops::RangeInclusive;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::ConfigError;

/// Characters used for randomly generated link targets.
pub const LINK_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890_-/";

/// Links per generated page.
pub const LINKS_PER_PAGE: RangeInclusive<usize> = 5..=10;

/// Length of a randomly generated link.
pub const LINK_LENGTH: RangeInclusive<usize> = 3..=20;

/// Upper bound on wordlist entries.
pub const MAX_WORDLIST_ENTRIES: usize = 100_000;

/// Upper bound on wordlist file size.
pub const MAX_WORDLIST_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Builds trap pages.
#[derive(Debug, Clone, Default)]
pub struct PageGenerator {
    wordlist: Vec<String>,
    form_endpoint: Option<String>,
}

impl PageGenerator {
    /// Creates a generator. With an empty wordlist links are random strings.
    pub fn new(wordlist: Vec<String>, form_endpoint: Option<String>) -> Self {
        PageGenerator {
            wordlist,
            form_endpoint,
        }
    }

    /// Generates a complete page using the thread-local RNG.
    pub fn generate_page(&self) -> String {
        self.generate_page_with(&mut rand::thread_rng())
    }

    pub fn generate_page_with<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut page = String::from("<html>\n<body>\n");

        let links = rng.gen_range(LINKS_PER_PAGE);
        for _ in 0..links {
            let link = escape_html(&self.random_link(rng));
            let _ = writeln!(page, "<a href=\"{link}\">{link}</a><br>");
        }

        if let Some(endpoint) = &self.form_endpoint {
            let _ = writeln!(
                page,
                "<form action=\"{}\" method=\"get\">\n<input type=\"text\" name=\"param\">\n<button type=\"submit\">Submit</button>\n</form>",
                escape_html(endpoint)
            );
        }

        page.push_str("</body>\n</html>");
        page
    }

    /// Returns a wordlist entry or, without a wordlist, a random string.
    pub fn random_link<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self.wordlist.choose(rng) {
            Some(word) => word.clone(),
            None => {
                let len = rng.gen_range(LINK_LENGTH);
                random_string(rng, len)
            }
        }
    }
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| LINK_CHARSET[rng.gen_range(0..LINK_CHARSET.len())] as char)
        .collect()
}

/// Escapes text for use in HTML content and double-quoted attributes.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reads a wordlist: one entry per line, trimmed, blank lines skipped.
pub fn load_wordlist(path: &Path) -> Result<Vec<String>, ConfigError> {
    let wordlist_err = |reason: String| ConfigError::Wordlist {
        path: path.display().to_string(),
        reason,
    };

    let size = std::fs::metadata(path)
        .map_err(|e| wordlist_err(e.to_string()))?
        .len();
    if size > MAX_WORDLIST_FILE_SIZE {
        return Err(wordlist_err(format!(
            "file too large ({size} bytes, max {MAX_WORDLIST_FILE_SIZE})"
        )));
    }

    let text = std::fs::read_to_string(path).map_err(|e| wordlist_err(e.to_string()))?;
    let mut entries = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if entries.len() >= MAX_WORDLIST_ENTRIES {
            return Err(wordlist_err(format!(
                "too many entries (max {MAX_WORDLIST_ENTRIES})"
            )));
        }
        entries.push(line.to_string());
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn count_links(page: &str) -> usize {
        page.matches("<a href=").count()
    }

    #[test]
    fn test_random_page_shape() {
        let generator = PageGenerator::default();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let page = generator.generate_page_with(&mut rng);
            assert!(page.starts_with("<html>\n<body>\n"));
            assert!(page.ends_with("</body>\n</html>"));
            assert!(LINKS_PER_PAGE.contains(&count_links(&page)));
            assert!(!page.contains("<form"));
        }
    }

    #[test]
    fn test_random_links_use_charset() {
        let generator = PageGenerator::default();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let link = generator.random_link(&mut rng);
            assert!(LINK_LENGTH.contains(&link.len()));
            assert!(link.bytes().all(|b| LINK_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn test_wordlist_links_are_escaped() {
        let generator = PageGenerator::new(vec!["a\"b<c>".to_string()], None);
        let page = generator.generate_page_with(&mut StdRng::seed_from_u64(1));

        assert!(page.contains("<a href=\"a&#34;b&lt;c&gt;\">a&#34;b&lt;c&gt;</a><br>"));
        assert!(!page.contains("a\"b"));
    }

    #[test]
    fn test_form_endpoint() {
        let generator = PageGenerator::new(Vec::new(), Some("/submit?x=1&y=2".to_string()));
        let page = generator.generate_page();

        assert!(page.contains("<form action=\"/submit?x=1&amp;y=2\" method=\"get\">"));
        assert!(page.contains("name=\"param\""));
    }

    #[test]
    fn test_load_wordlist_trims_and_skips_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "admin\n\n  login  \r\n\t\nbackup/\n").unwrap();

        let words = load_wordlist(&path).unwrap();
        assert_eq!(words, vec!["admin", "login", "backup/"]);
    }

    #[test]
    fn test_load_wordlist_rejects_too_many_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.txt");
        let body = "w\n".repeat(MAX_WORDLIST_ENTRIES + 1);
        std::fs::write(&path, body).unwrap();

        assert!(matches!(
            load_wordlist(&path),
            Err(ConfigError::Wordlist { .. })
        ));
    }

    #[test]
    fn test_load_wordlist_missing_file() {
        let err = load_wordlist(Path::new("/nonexistent/words.txt")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/words.txt"));
    }
}
