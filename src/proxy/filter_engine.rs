//! Filter engine (C3).
//!
//! Evaluates the configured include/exclude regex sets against a channel's
//! title and group. All patterns are compiled once at startup.

use anyhow::Result;
use regex::Regex;

use crate::config::FilterConfig;
use crate::models::StreamInfo;

pub struct FilterEngine {
    include_groups: Vec<Regex>,
    include_titles: Vec<Regex>,
    exclude_groups: Vec<Regex>,
    exclude_titles: Vec<Regex>,
}

impl FilterEngine {
    pub fn new(config: &FilterConfig) -> Result<Self> {
        Ok(Self {
            include_groups: compile_all(&config.include_groups)?,
            include_titles: compile_all(&config.include_titles)?,
            exclude_groups: compile_all(&config.exclude_groups)?,
            exclude_titles: compile_all(&config.exclude_titles)?,
        })
    }

    /// Decide whether a parsed channel enters the merged playlist.
    ///
    /// - With no patterns configured everything is admitted.
    /// - Any include match (title or group) admits.
    /// - Otherwise any exclude match rejects.
    /// - Otherwise admit only when no include patterns exist at all, so an
    ///   include-less configuration treats "not excluded" as admitted.
    pub fn admit(&self, info: &StreamInfo) -> bool {
        let has_includes = !self.include_groups.is_empty() || !self.include_titles.is_empty();
        let has_excludes = !self.exclude_groups.is_empty() || !self.exclude_titles.is_empty();
        if !has_includes && !has_excludes {
            return true;
        }

        if self.include_groups.iter().any(|re| re.is_match(&info.group))
            || self.include_titles.iter().any(|re| re.is_match(&info.title))
        {
            return true;
        }

        if self.exclude_groups.iter().any(|re| re.is_match(&info.group))
            || self.exclude_titles.iter().any(|re| re.is_match(&info.title))
        {
            return false;
        }

        !has_includes
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn stream(title: &str, group: &str) -> StreamInfo {
        StreamInfo {
            title: title.to_string(),
            tvg_id: String::new(),
            tvg_chno: String::new(),
            tvg_type: String::new(),
            logo_url: String::new(),
            group: group.to_string(),
            urls: BTreeMap::new(),
            source_m3u: "1".to_string(),
            source_index: 0,
        }
    }

    fn engine(
        include_groups: &[&str],
        include_titles: &[&str],
        exclude_groups: &[&str],
        exclude_titles: &[&str],
    ) -> FilterEngine {
        FilterEngine::new(&FilterConfig {
            include_groups: include_groups.iter().map(|s| s.to_string()).collect(),
            include_titles: include_titles.iter().map(|s| s.to_string()).collect(),
            exclude_groups: exclude_groups.iter().map(|s| s.to_string()).collect(),
            exclude_titles: exclude_titles.iter().map(|s| s.to_string()).collect(),
            title_substr_filter: None,
        })
        .unwrap()
    }

    #[test]
    fn empty_config_admits_everything() {
        let engine = engine(&[], &[], &[], &[]);
        assert!(engine.admit(&stream("Anything", "Whatever")));
    }

    #[test]
    fn include_group_gates_admission() {
        let engine = engine(&["Sports"], &[], &[], &[]);
        assert!(engine.admit(&stream("Y", "Sports")));
        assert!(!engine.admit(&stream("X", "News")));
    }

    #[test]
    fn excludes_only_reject_matches() {
        let engine = engine(&[], &[], &["News"], &[]);
        assert!(!engine.admit(&stream("X", "News")));
        assert!(engine.admit(&stream("Y", "Sports")));
    }

    #[test]
    fn include_beats_exclude() {
        let engine = engine(&["Sports"], &[], &["Sports"], &[]);
        assert!(engine.admit(&stream("Y", "Sports")));
    }

    #[test]
    fn include_title_admits_regardless_of_group() {
        let engine = engine(&["Sports"], &["BBC"], &[], &[]);
        assert!(engine.admit(&stream("BBC One", "News")));
        assert!(!engine.admit(&stream("CNN", "News")));
    }
}
