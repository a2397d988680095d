//! Input checks applied at the UI boundary, before a value reaches the engine.

use crate::model::{FormPatch, MetadataPatch};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Photo number must be 1-{max} characters, got {len}")]
    PhotoNumberLength { len: usize, max: usize },

    #[error("Photo number contains disallowed character {0:?}")]
    PhotoNumberChar(char),

    #[error("Description is longer than {max} characters")]
    DescriptionTooLong { max: usize },

    #[error("Description contains a control character")]
    DescriptionControlChar,

    #[error("ELR must be at most {max} uppercase letters or digits")]
    InvalidElr { max: usize },

    #[error("Structure number must be at most {max} characters from A-Z a-z 0-9 / . -")]
    InvalidStructureNo { max: usize },

    #[error("Date must be YYYY-MM-DD")]
    InvalidDate,
}

pub type Result<T> = std::result::Result<T, ValidationError>;

const PHOTO_NUMBER_MAX: usize = 20;
const DESCRIPTION_MAX: usize = 500;
const ELR_MAX: usize = 4;
const STRUCTURE_NO_MAX: usize = 20;

pub fn validate_photo_number(value: &str) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > PHOTO_NUMBER_MAX {
        return Err(ValidationError::PhotoNumberLength {
            len,
            max: PHOTO_NUMBER_MAX,
        });
    }
    match value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(*c, '.' | '_' | '-' | '/')))
    {
        Some(c) => Err(ValidationError::PhotoNumberChar(c)),
        None => Ok(()),
    }
}

pub fn validate_description(value: &str) -> Result<()> {
    if value.chars().count() > DESCRIPTION_MAX {
        return Err(ValidationError::DescriptionTooLong {
            max: DESCRIPTION_MAX,
        });
    }
    if value.chars().any(|c| c.is_control() && c != '\t' && c != '\n') {
        return Err(ValidationError::DescriptionControlChar);
    }
    Ok(())
}

pub fn validate_elr(value: &str) -> Result<()> {
    let ok = value.len() <= ELR_MAX
        && value
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidElr { max: ELR_MAX })
    }
}

pub fn validate_structure_no(value: &str) -> Result<()> {
    let ok = value.len() <= STRUCTURE_NO_MAX
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidStructureNo {
            max: STRUCTURE_NO_MAX,
        })
    }
}

/// Empty, or `YYYY-MM-DD` with a plausible month and day.
pub fn validate_date(value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    let parts: Vec<&str> = value.split('-').collect();
    let [year, month, day] = parts.as_slice() else {
        return Err(ValidationError::InvalidDate);
    };
    let digits = |s: &str, n: usize| s.len() == n && s.chars().all(|c| c.is_ascii_digit());
    if !(digits(*year, 4) && digits(*month, 2) && digits(*day, 2)) {
        return Err(ValidationError::InvalidDate);
    }
    let month: u32 = month.parse().map_err(|_| ValidationError::InvalidDate)?;
    let day: u32 = day.parse().map_err(|_| ValidationError::InvalidDate)?;
    if (1..=12).contains(&month) && (1..=31).contains(&day) {
        Ok(())
    } else {
        Err(ValidationError::InvalidDate)
    }
}

pub fn validate_form_patch(patch: &FormPatch) -> Result<()> {
    if let Some(elr) = &patch.elr {
        validate_elr(elr)?;
    }
    if let Some(structure_no) = &patch.structure_no {
        validate_structure_no(structure_no)?;
    }
    if let Some(date) = &patch.date {
        validate_date(date)?;
    }
    Ok(())
}

/// An empty photo number clears the field and is allowed here.
pub fn validate_metadata_patch(patch: &MetadataPatch) -> Result<()> {
    if let Some(photo_number) = patch.photo_number.as_deref().filter(|s| !s.is_empty()) {
        validate_photo_number(photo_number)?;
    }
    if let Some(description) = &patch.description {
        validate_description(description)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_numbers() {
        assert!(validate_photo_number("1").is_ok());
        assert!(validate_photo_number("A-12/3_b.4").is_ok());
        assert_eq!(
            validate_photo_number(""),
            Err(ValidationError::PhotoNumberLength { len: 0, max: 20 })
        );
        assert!(validate_photo_number(&"9".repeat(21)).is_err());
        assert_eq!(
            validate_photo_number("12 3"),
            Err(ValidationError::PhotoNumberChar(' '))
        );
    }

    #[test]
    fn test_descriptions() {
        assert!(validate_description("crack in\tpier\nnorth face").is_ok());
        assert!(validate_description(&"x".repeat(500)).is_ok());
        assert!(validate_description(&"x".repeat(501)).is_err());
        assert_eq!(
            validate_description("bell\u{7}"),
            Err(ValidationError::DescriptionControlChar)
        );
    }

    #[test]
    fn test_elr() {
        assert!(validate_elr("ABC1").is_ok());
        assert!(validate_elr("").is_ok());
        assert!(validate_elr("abc").is_err());
        assert!(validate_elr("ABCDE").is_err());
    }

    #[test]
    fn test_structure_no() {
        assert!(validate_structure_no("12/3.4-A").is_ok());
        assert!(validate_structure_no("12 3").is_err());
        assert!(validate_structure_no(&"1".repeat(21)).is_err());
    }

    #[test]
    fn test_dates() {
        assert!(validate_date("").is_ok());
        assert!(validate_date("2024-11-08").is_ok());
        assert!(validate_date("2024-13-01").is_err());
        assert!(validate_date("24-11-08").is_err());
        assert!(validate_date("yesterday").is_err());
    }

    #[test]
    fn test_patches() {
        let form = FormPatch {
            elr: Some("ABC".into()),
            structure_no: Some("bad no".into()),
            date: None,
        };
        assert!(validate_form_patch(&form).is_err());

        let clear = MetadataPatch {
            photo_number: Some(String::new()),
            description: Some(String::new()),
        };
        assert!(validate_metadata_patch(&clear).is_ok());
    }
}
