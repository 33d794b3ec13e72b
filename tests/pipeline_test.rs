//! End-to-end tests of the merge pipeline over local file sources.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use m3u_merger::config::Config;
use m3u_merger::processor::PlaylistProcessor;
use m3u_merger::slug::{decode_slug, hydrate_urls, split_extension};

fn write_source(dir: &Path, name: &str, contents: &str) -> (String, String) {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    (name.to_string(), format!("file://{}", path.display()))
}

fn build_config(dir: &Path, sources: &[(&str, &str)], extra: &[(&str, &str)]) -> Arc<Config> {
    let mut vars: Vec<(String, String)> = sources
        .iter()
        .map(|(id, url)| (format!("M3U_URL_{}", id), url.to_string()))
        .collect();
    vars.push(("BASE_URL".to_string(), "http://proxy.example".to_string()));
    vars.push((
        "DATA_PATH".to_string(),
        dir.join("data").display().to_string(),
    ));
    vars.push((
        "TEMP_PATH".to_string(),
        dir.join("temp").display().to_string(),
    ));
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Arc::new(Config::from_vars(vars).unwrap())
}

async fn run_pipeline(config: Arc<Config>) -> String {
    let processor = PlaylistProcessor::new(config).unwrap();
    let path = processor.run(CancellationToken::new()).await.unwrap();
    std::fs::read_to_string(path).unwrap()
}

fn extinf_lines(playlist: &str) -> Vec<&str> {
    playlist
        .lines()
        .filter(|l| l.starts_with("#EXTINF:"))
        .collect()
}

#[tokio::test]
async fn merges_common_titles_across_sources() {
    let dir = tempfile::tempdir().unwrap();
    let (_, url1) = write_source(
        dir.path(),
        "one.m3u",
        "#EXTM3U\n#EXTINF:-1 tvg-id=\"bbc1\" tvg-name=\"BBC One\" group-title=\"UK\",BBC One\nhttp://a/bbc1\n",
    );
    let (_, url2) = write_source(
        dir.path(),
        "two.m3u",
        "#EXTM3U\n#EXTINF:-1 tvg-id=\"bbc1\" tvg-name=\"BBC One\" group-title=\"UK\",BBC One\nhttp://b/bbc1\n",
    );

    let config = build_config(dir.path(), &[("1", &url1), ("2", &url2)], &[]);
    let playlist = run_pipeline(config.clone()).await;

    assert!(playlist.starts_with("#EXTM3U\n"));
    let entries = extinf_lines(&playlist);
    assert_eq!(entries.len(), 1, "duplicate titles must merge:\n{}", playlist);
    assert!(entries[0].contains("tvg-id=\"bbc1\""));
    assert!(entries[0].ends_with(",BBC One"));

    // The stream URL embeds the channel identity; decoding it and
    // rehydrating from the index must expose both upstream alternatives.
    let stream_url = playlist
        .lines()
        .find(|l| l.starts_with("http://proxy.example/p/"))
        .expect("proxied stream url");
    let slug_segment = stream_url.rsplit('/').next().unwrap();
    let (slug, _) = split_extension(slug_segment);
    let mut info = decode_slug(slug).unwrap();
    assert_eq!(info.title, "BBC One");
    assert!(info.urls.is_empty());

    hydrate_urls(&mut info, &config.streams_dir());
    assert_eq!(info.urls.len(), 2, "both sources must contribute a url");
    let records: Vec<&String> = info
        .urls
        .values()
        .flat_map(|inner| inner.values())
        .collect();
    assert!(records.iter().any(|r| r.ends_with(":::http://a/bbc1")));
    assert!(records.iter().any(|r| r.ends_with(":::http://b/bbc1")));
}

#[tokio::test]
async fn include_group_filter_gates_admission() {
    let dir = tempfile::tempdir().unwrap();
    let (_, url1) = write_source(
        dir.path(),
        "one.m3u",
        "#EXTM3U\n\
         #EXTINF:-1 group-title=\"News\",X\nhttp://a/x\n\
         #EXTINF:-1 group-title=\"Sports\",Y\nhttp://a/y\n",
    );

    let config = build_config(
        dir.path(),
        &[("1", &url1)],
        &[("INCLUDE_GROUPS_1", "Sports")],
    );
    let playlist = run_pipeline(config).await;

    let entries = extinf_lines(&playlist);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].ends_with(",Y"));
}

#[tokio::test]
async fn sorts_numerically_by_channel_number() {
    let dir = tempfile::tempdir().unwrap();
    let body: String = ["101", "2", "200", "1", "201", "100"]
        .iter()
        .map(|n| format!("#EXTINF:-1 tvg-chno=\"{}\",C{}\nhttp://a/{}\n", n, n, n))
        .collect();
    let (_, url1) = write_source(dir.path(), "one.m3u", &format!("#EXTM3U\n{}", body));

    let config = build_config(
        dir.path(),
        &[("1", &url1)],
        &[("SORTING_KEY", "tvg-chno")],
    );
    let playlist = run_pipeline(config).await;

    let order: Vec<String> = extinf_lines(&playlist)
        .iter()
        .map(|l| l.rsplit(',').next().unwrap().to_string())
        .collect();
    assert_eq!(order, vec!["C1", "C2", "C100", "C101", "C200", "C201"]);
}

#[tokio::test]
async fn broken_sources_do_not_fail_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let (_, good) = write_source(
        dir.path(),
        "good.m3u",
        "#EXTM3U\n#EXTINF:-1,Kept\nhttp://a/kept\n",
    );
    let (_, garbage) = write_source(
        dir.path(),
        "garbage.m3u",
        "this is not\nan m3u playlist\nat all\n",
    );

    let config = build_config(
        dir.path(),
        &[
            ("1", &good),
            ("2", &garbage),
            ("3", "file:///does/not/exist.m3u"),
        ],
        &[],
    );
    let playlist = run_pipeline(config).await;

    let entries = extinf_lines(&playlist);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].ends_with(",Kept"));
}

#[tokio::test]
async fn republishing_keeps_only_the_newest_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let (_, url1) = write_source(
        dir.path(),
        "one.m3u",
        "#EXTM3U\n#EXTINF:-1,Only\nhttp://a/only\n",
    );
    let config = build_config(dir.path(), &[("1", &url1)], &[]);

    let processor = PlaylistProcessor::new(config.clone()).unwrap();
    let first = processor.run(CancellationToken::new()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let second = processor.run(CancellationToken::new()).await.unwrap();
    assert_ne!(first, second);

    let artifacts: Vec<_> = std::fs::read_dir(config.processed_dir())
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "m3u").unwrap_or(false))
        .collect();
    assert_eq!(artifacts, vec![second.clone()]);
    assert_eq!(processor.result_path(), Some(second));

    // No stray temporary files survive a successful publish.
    let leftovers: Vec<_> = std::fs::read_dir(config.processed_dir())
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn cancelled_run_discards_in_flight_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (_, url1) = write_source(
        dir.path(),
        "one.m3u",
        "#EXTM3U\n#EXTINF:-1,Only\nhttp://a/only\n",
    );
    let config = build_config(dir.path(), &[("1", &url1)], &[]);

    let processor = PlaylistProcessor::new(config.clone()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = processor.run(cancel).await.unwrap_err();
    assert!(matches!(err, m3u_merger::errors::PipelineError::Cancelled));

    if let Ok(entries) = std::fs::read_dir(config.processed_dir()) {
        assert_eq!(entries.count(), 0, "no artifacts after a cancelled run");
    }
}
