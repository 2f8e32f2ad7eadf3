//! Naming conventions shared by the stages.

/// Prefix of automatically generated run names.
pub const RUN_NAME_PREFIX: &str = "umccr--automated";

/// Builds the run name `umccr--automated--<workflow>--<version>--<portalRunId>`.
///
/// Dots in the version are replaced with dashes.
///
/// # Examples
///
/// ```
/// use ctdna_orchestrator::utils::workflow_run_name;
///
/// assert_eq!(
///     workflow_run_name("dragen-tso500-ctdna", "2.6.0", "20250620abcd6789"),
///     "umccr--automated--dragen-tso500-ctdna--2-6-0--20250620abcd6789"
/// );
/// ```
#[must_use]
pub fn workflow_run_name(workflow_name: &str, workflow_version: &str, portal_run_id: &str) -> String {
    format!(
        "{RUN_NAME_PREFIX}--{workflow_name}--{}--{portal_run_id}",
        workflow_version.replace('.', "-")
    )
}

/// Author attached to comments posted by this service.
#[must_use]
pub fn comment_author(workflow_name: &str) -> String {
    format!("{workflow_name}-workflow-orchestration-service")
}

/// Ensures a URI prefix ends with a single `/`.
#[must_use]
pub fn ensure_trailing_slash(uri: &str) -> String {
    if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{uri}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_author() {
        assert_eq!(
            comment_author("dragen-tso500-ctdna"),
            "dragen-tso500-ctdna-workflow-orchestration-service"
        );
    }

    #[test]
    fn test_ensure_trailing_slash() {
        assert_eq!(ensure_trailing_slash("s3://bucket/a"), "s3://bucket/a/");
        assert_eq!(ensure_trailing_slash("s3://bucket/a/"), "s3://bucket/a/");
    }
}
