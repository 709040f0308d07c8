//! Small helpers shared across the crate: container naming, environment
//! switches and diagnostics setup.

use rand::Rng;

/// Namespace prefixed to every generated container name, to more easily
/// identify which containers were started by this library.
pub(crate) const NAMESPACE: &str = "testctr";

/// Upper bound the docker daemon family places on container names.
const MAX_NAME_LEN: usize = 63;

pub(crate) fn generate_random_string(len: usize) -> String {
    let mut random_string = String::new();
    let mut rng = rand::thread_rng();
    for _i in 0..len {
        let letter: char = rng.gen_range(b'a'..=b'z') as char;
        random_string.push(letter);
    }

    random_string
}

/// Produce a unique container name from an image reference.
///
/// The name is composed of the namespace, the lowercased image basename and
/// a random suffix. Characters the daemon rejects are folded to `-` and the
/// result never exceeds the daemon's 63 character limit.
pub(crate) fn unique_container_name(image: &str) -> String {
    let base = image
        .rsplit('/')
        .next()
        .unwrap_or(image)
        .split([':', '@'])
        .next()
        .unwrap_or(image);

    let base: String = base
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '-',
        })
        .collect();

    // The suffix is what keeps names unique; trim the stem, never the
    // suffix.
    let suffix = generate_random_string(12);
    let mut stem = format!("{}-{}", NAMESPACE, base);
    stem.truncate(MAX_NAME_LEN - suffix.len() - 1);
    format!("{}-{}", stem, suffix)
}

/// Whether a boolean-ish environment variable is set.
fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"),
        Err(_) => false,
    }
}

/// Whether cleanup should be skipped for containers owned by the current
/// test.
///
/// `TESTCTR_KEEP` keeps every container; `TESTCTR_KEEP_FAILED` keeps them
/// only when the owning test is unwinding from a panic.
pub(crate) fn keep_containers() -> bool {
    if env_flag("TESTCTR_KEEP") {
        return true;
    }
    env_flag("TESTCTR_KEEP_FAILED") && std::thread::panicking()
}

/// The host component used to reach published container ports.
///
/// Defaults to loopback for a local daemon; when `DOCKER_HOST` points at a
/// remote daemon its hostname component is used instead.
pub(crate) fn endpoint_host() -> String {
    match std::env::var("DOCKER_HOST") {
        Ok(url) => docker_host_hostname(&url),
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// Extract the addressable hostname from a `DOCKER_HOST` style URL.
///
/// Unix sockets and unrecognized schemes resolve to loopback.
pub(crate) fn docker_host_hostname(url: &str) -> String {
    if url.starts_with("unix://") || url.starts_with("npipe://") {
        return "127.0.0.1".to_string();
    }
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(rest) => rest
            .split_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| rest.trim_end_matches('/').to_string()),
        None => "127.0.0.1".to_string(),
    }
}

/// Install a `tracing` subscriber for test diagnostics.
///
/// Honors `RUST_LOG` when set; otherwise `TESTCTR_VERBOSE` raises the crate
/// log level to debug. Safe to call from multiple tests - only the first
/// call installs the subscriber.
pub fn init_diagnostics() {
    let default = if env_flag("TESTCTR_VERBOSE") {
        "testctr=debug"
    } else {
        "testctr=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
