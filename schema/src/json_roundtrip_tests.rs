//! JSON round-trip tests for schema types
//!
//! These tests check that configuration-facing types accept their documented
//! camelCase spellings, apply serde defaults, and survive a round trip.

use crate::events::*;
use crate::process::*;
use schemars::schema_for;
use std::collections::HashMap;
use std::path::PathBuf;

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to test JSON round-trip for any serializable type
    fn test_json_roundtrip<T>(original: &T)
    where
        T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
    {
        let json = serde_json::to_string(original).expect("Failed to serialize to JSON");
        let deserialized: T = serde_json::from_str(&json).expect("Failed to deserialize from JSON");
        assert_eq!(*original, deserialized, "Round-trip failed for JSON: {}", json);
    }

    #[test]
    fn test_process_options_json_roundtrip() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        let options = ProcessOptions {
            working_directory: Some(PathBuf::from("/srv/app")),
            environment: env,
            environment_mode: EnvironmentMode::Clear,
            stdin: StdioMode::Null,
            stdout: StdioMode::Pipe,
            stderr: StdioMode::Inherit,
            detach_process_group: false,
        };
        test_json_roundtrip(&options);
    }

    #[test]
    fn test_process_options_from_minimal_json() {
        let options: ProcessOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ProcessOptions::default());

        let options: ProcessOptions =
            serde_json::from_str(r#"{"stderr":"inherit","detachProcessGroup":false}"#).unwrap();
        assert_eq!(options.stderr, StdioMode::Inherit);
        assert!(!options.detach_process_group);
    }

    #[test]
    fn test_program_spec_from_json() {
        let spec: ProgramSpec = serde_json::from_str(
            r#"{"name":"fmt","command":"rustfmt","args":["--emit","stdout"],"input":"fn main(){}"}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "fmt");
        assert_eq!(spec.args, vec!["--emit", "stdout"]);
        assert_eq!(spec.input.as_deref(), Some("fn main(){}"));
        assert!(!spec.shell);
        assert!(spec.working_directory.is_none());
        test_json_roundtrip(&spec);
    }

    #[test]
    fn test_process_result_json_roundtrip() {
        let result = ProcessResult {
            exit_status: -15,
            std_out: "partial\n".to_string(),
            std_err: String::new(),
        };
        test_json_roundtrip(&result);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exitStatus"], -15);
        assert_eq!(json["stdOut"], "partial\n");
    }

    #[test]
    fn test_process_event_json_roundtrip() {
        test_json_roundtrip(&ProcessEvent::started(
            "svc".to_string(),
            100,
            "sleep".to_string(),
            vec!["1".to_string()],
        ));
        test_json_roundtrip(&ProcessEvent::output(
            "svc".to_string(),
            100,
            OutputStream::Stdout,
            "line\n".to_string(),
        ));
        test_json_roundtrip(&ProcessEvent::exited(
            "svc".to_string(),
            100,
            ExitStatus::Exited { code: 0 },
        ));
    }

    #[test]
    fn test_schema_generation() {
        let schema = serde_json::to_value(schema_for!(ProgramSpec)).unwrap();
        assert!(schema["properties"]["workingDirectory"].is_object());

        let schema = serde_json::to_value(schema_for!(ProcessEvent)).unwrap();
        assert!(schema.is_object());
    }
}
