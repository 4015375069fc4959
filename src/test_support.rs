//! Shell stubs that stand in for the external tools in unit tests.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::tools::ToolPaths;

/// Serializes tests that write and then execute stub scripts; a concurrent
/// fork can otherwise inherit the open write handle and fail with ETXTBSY.
pub static STUB_LOCK: Mutex<()> = parking_lot::const_mutex(());

pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/usr/bin/env bash\nset -eu\n{body}");
    fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

/// ffprobe stub printing a fixed JSON document.
pub fn install_ffprobe(dir: &Path, json: &str) -> PathBuf {
    let body = format!(
        "echo \"$*\" >> '{log}'\ncat <<'JSON'\n{json}\nJSON\n",
        log = dir.join("ffprobe.log").display()
    );
    install_stub(dir, "ffprobe", &body)
}

pub fn ffprobe_json(duration: f64, title: Option<&str>, creation_time: Option<&str>) -> String {
    let mut tags = serde_json::Map::new();
    if let Some(title) = title {
        tags.insert("title".into(), title.into());
    }
    if let Some(creation_time) = creation_time {
        tags.insert("creation_time".into(), creation_time.into());
    }
    serde_json::json!({
        "streams": [
            { "index": 0, "codec_type": "audio", "codec_name": "aac" }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": format!("{duration:.6}"),
            "tags": tags
        }
    })
    .to_string()
}

/// ffmpeg stub that copies its `-i` input to the last argument and logs the
/// full argument list.
pub fn install_ffmpeg(dir: &Path) -> PathBuf {
    let body = format!(
        r#"echo "$*" >> '{log}'
input=""
prev=""
for arg in "$@"; do
  if [[ "$prev" == "-i" ]]; then input="$arg"; fi
  prev="$arg"
done
out="${{@: -1}}"
cp "$input" "$out"
"#,
        log = dir.join("ffmpeg.log").display()
    );
    install_stub(dir, "ffmpeg", &body)
}

pub fn install_failing(dir: &Path, name: &str) -> PathBuf {
    install_stub(
        dir,
        name,
        &format!(
            "echo \"$*\" >> '{log}'\necho 'simulated failure' >&2\nexit 1\n",
            log = dir.join(format!("{name}.log")).display()
        ),
    )
}

/// twspace_dl stub writing `<output>.m4a`.
pub fn install_twspace_dl(dir: &Path) -> PathBuf {
    let body = format!(
        r#"echo "$*" >> '{log}'
out=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o) shift; out="$1" ;;
  esac
  shift
done
mkdir -p "$(dirname "$out")"
printf 'twspace-audio-bytes' > "${{out}}.m4a"
"#,
        log = dir.join("twspace_dl.log").display()
    );
    install_stub(dir, "twspace_dl", &body)
}

/// yt-dlp stub answering metadata queries with `info_json` and downloads by
/// writing `<output>` with `%(ext)s` replaced by `m4a`.
pub fn install_yt_dlp(dir: &Path, info_json: &str) -> PathBuf {
    let body = format!(
        r#"echo "$*" >> '{log}'
args=("$@")
out=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o|--output) shift; out="$1" ;;
  esac
  shift
done
if printf '%s\n' "${{args[@]}}" | grep -q -- '--dump-single-json'; then
cat <<'JSON'
{info_json}
JSON
  exit 0
fi
target="${{out//%(ext)s/m4a}}"
mkdir -p "$(dirname "$target")"
printf 'yt-dlp-audio-bytes' > "$target"
printf '{{}}' > "${{out//.%(ext)s/}}.info.json"
"#,
        log = dir.join("yt-dlp.log").display()
    );
    install_stub(dir, "yt-dlp", &body)
}

pub fn call_count(dir: &Path, tool: &str) -> usize {
    fs::read_to_string(dir.join(format!("{tool}.log")))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

pub fn stub_tools(dir: &Path, ffprobe_output: &str, info_json: &str) -> ToolPaths {
    ToolPaths {
        twspace_dl: install_twspace_dl(dir),
        yt_dlp: install_yt_dlp(dir, info_json),
        ffmpeg: install_ffmpeg(dir),
        ffprobe: install_ffprobe(dir, ffprobe_output),
    }
}
