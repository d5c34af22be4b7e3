use crate::CoreError;
use elmirror_store::PackageStatus;

pub fn validate_transition(from: PackageStatus, to: PackageStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            PackageStatus::Pending | PackageStatus::Failed,
            PackageStatus::Success | PackageStatus::Failed
        ) | (PackageStatus::Ignored, PackageStatus::Pending)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
