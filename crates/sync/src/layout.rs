use jattach_manifest::HashAlgorithm;
use time::OffsetDateTime;
use time::macros::format_description;

const DATA_FOLDER: &str = "Data";
const MANIFEST_FOLDER: &str = "Manifests";
const INPUT_FOLDER: &str = "Inputs";

/// Where things live in the object store, relative to a root prefix.
///
/// ```text
/// {root}/Data/{hash}.{alg}
/// {root}/Manifests/{farm}/{queue}/Inputs/{guid}/{name}_input
/// {root}/Manifests/{farm}/{queue}/{job}/{step}/{task}/{time}_{action}/{name}_output
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

/// Identifies the task run whose outputs are being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget<'a> {
    pub farm_id: &'a str,
    pub queue_id: &'a str,
    pub job_id: &'a str,
    pub step_id: &'a str,
    pub task_id: &'a str,
    pub session_action_id: &'a str,
}

impl Layout {
    pub fn new(root_prefix: impl AsRef<str>) -> Self {
        Self {
            root: root_prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, parts: &[&str]) -> String {
        std::iter::once(self.root.as_str())
            .chain(parts.iter().copied())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Key of the blob holding content with the given hash.
    pub fn data_key(&self, hash: &str, alg: HashAlgorithm) -> String {
        self.join(&[DATA_FOLDER, &format!("{hash}.{}", alg.as_str())])
    }

    /// Blobs written by early clients carry no algorithm extension.
    pub fn legacy_data_key(&self, hash: &str) -> String {
        self.join(&[DATA_FOLDER, hash])
    }

    /// Stable per-root manifest name: the hash of the location name followed
    /// by the root path, so re-submitting the same root overwrites the same
    /// object.
    pub fn manifest_name(location_name: Option<&str>, root_path: &str, alg: HashAlgorithm) -> String {
        alg.hash_bytes(format!("{}{root_path}", location_name.unwrap_or_default()).as_bytes())
    }

    /// Key for an input manifest under a fresh random folder.
    pub fn input_manifest_key(&self, farm_id: &str, queue_id: &str, manifest_name: &str) -> String {
        let guid = uuid::Uuid::new_v4().simple().to_string();
        self.join(&[MANIFEST_FOLDER, farm_id, queue_id, INPUT_FOLDER, &guid, &format!("{manifest_name}_input")])
    }

    /// Folder all output manifests of one session action share.
    pub fn output_manifest_prefix(&self, target: &OutputTarget<'_>, started: OffsetDateTime) -> String {
        let folder = format!("{}_{}", iso_timestamp(started), target.session_action_id);
        self.join(&[
            MANIFEST_FOLDER,
            target.farm_id,
            target.queue_id,
            target.job_id,
            target.step_id,
            target.task_id,
            &folder,
        ])
    }

    pub fn output_manifest_key(&self, target: &OutputTarget<'_>, started: OffsetDateTime, manifest_name: &str) -> String {
        format!("{}/{manifest_name}_output", self.output_manifest_prefix(target, started))
    }
}

/// `2024-05-01T09:30:00.000250Z`: UTC with microsecond precision.
fn iso_timestamp(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");
    // The description has no offset or textual components; formatting a UTC
    // datetime with it cannot fail.
    at.to_offset(time::UtcOffset::UTC).format(&format).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    const TARGET: OutputTarget<'static> = OutputTarget {
        farm_id: "farm-1",
        queue_id: "queue-2",
        job_id: "job-3",
        step_id: "step-4",
        task_id: "task-5",
        session_action_id: "sessionaction-6",
    };

    #[rstest]
    #[case("Root", "Root/Data/abc.xxh128")]
    #[case("/Root/", "Root/Data/abc.xxh128")]
    #[case("", "Data/abc.xxh128")]
    fn test_data_key(#[case] root: &str, #[case] expected: &str) {
        assert_eq!(Layout::new(root).data_key("abc", HashAlgorithm::Xxh128), expected);
    }

    #[test]
    fn test_legacy_data_key() {
        assert_eq!(Layout::new("Root").legacy_data_key("abc"), "Root/Data/abc");
    }

    #[test]
    fn test_manifest_name_is_stable_and_location_sensitive() {
        let plain = Layout::manifest_name(None, "/projects/shot", HashAlgorithm::Xxh128);
        assert_eq!(plain, Layout::manifest_name(Some(""), "/projects/shot", HashAlgorithm::Xxh128));
        assert_eq!(plain, HashAlgorithm::Xxh128.hash_bytes(b"/projects/shot"));
        assert_ne!(plain, Layout::manifest_name(Some("Studio"), "/projects/shot", HashAlgorithm::Xxh128));
    }

    #[test]
    fn test_input_manifest_key_uses_fresh_folder() {
        let layout = Layout::new("Root");
        let first = layout.input_manifest_key("farm-1", "queue-2", "abc");
        let second = layout.input_manifest_key("farm-1", "queue-2", "abc");
        assert_ne!(first, second);
        let parts: Vec<_> = first.split('/').collect();
        assert_eq!(parts[..5], ["Root", "Manifests", "farm-1", "queue-2", "Inputs"]);
        assert_eq!(parts[5].len(), 32);
        assert!(parts[5].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[6], "abc_input");
    }

    #[test]
    fn test_output_manifest_key() {
        let started = datetime!(2024-05-01 09:30:00.000250 UTC);
        assert_eq!(
            Layout::new("Root").output_manifest_key(&TARGET, started, "abc"),
            "Root/Manifests/farm-1/queue-2/job-3/step-4/task-5/2024-05-01T09:30:00.000250Z_sessionaction-6/abc_output"
        );
    }

    #[test]
    fn test_timestamp_is_converted_to_utc() {
        assert_eq!(iso_timestamp(datetime!(2024-05-01 11:30:00 +2)), "2024-05-01T09:30:00.000000Z");
    }
}
