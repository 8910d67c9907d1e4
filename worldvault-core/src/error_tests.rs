/*!
Tests for the backup error taxonomy.
*/

#[cfg(test)]
mod tests {
    use crate::error::BackupError;
    use std::io;
    use std::path::Path;

    #[test]
    fn test_backup_error_display() {
        let error = BackupError::configuration("BUCKET_NAME is required");
        assert_eq!(
            error.to_string(),
            "Configuration error: BUCKET_NAME is required"
        );

        let error = BackupError::upload("world_2024-01-01_00-00-00.tar.gz", "connection reset");
        assert_eq!(
            error.to_string(),
            "Failed to upload 'world_2024-01-01_00-00-00.tar.gz': connection reset"
        );

        let error = BackupError::list("world_", "access denied");
        assert!(error.to_string().contains("prefix 'world_'"));
    }

    #[test]
    fn test_source_unavailable_mentions_path() {
        let error = BackupError::source_unavailable("/minecraft/missing", "not found");
        let message = error.to_string();
        assert!(message.contains("/minecraft/missing"));
        assert!(message.contains("not found"));

        match error {
            BackupError::SourceUnavailable { path, .. } => {
                assert_eq!(path, Path::new("/minecraft/missing"));
            }
            _ => panic!("Expected SourceUnavailable"),
        }
    }

    #[test]
    fn test_backup_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "Access denied");
        let error = BackupError::from(io_error);

        match error {
            BackupError::Io(ref io_err) => {
                assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_error_stage_labels() {
        assert_eq!(BackupError::archive("x").stage(), "archive");
        assert_eq!(BackupError::source_unavailable("/a", "b").stage(), "archive");
        assert_eq!(BackupError::upload("k", "m").stage(), "upload");
        assert_eq!(BackupError::list("p", "m").stage(), "list");
        assert_eq!(BackupError::delete("k", "m").stage(), "delete");
        assert_eq!(BackupError::bucket("b", "m").stage(), "bucket");
        assert_eq!(BackupError::InvalidKey("k".into()).stage(), "naming");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BackupError>();
        assert_sync::<BackupError>();
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(BackupError::delete("world_x.tar.gz", "boom"))
        }

        assert!(returns_error().is_err());
    }
}
