//! Core attributes indexed in the study, series and instance tables.

use super::QueryTagLevel;
use super::vr::ValueRepresentation;

/// A core attribute and the column it is stored in.
#[derive(Debug, PartialEq, Eq)]
pub struct CoreTag {
    /// DICOM keyword.
    pub keyword: &'static str,
    /// Tag path.
    pub path: &'static str,
    /// Value representation.
    pub vr: ValueRepresentation,
    /// Level of the table holding the column.
    pub level: QueryTagLevel,
    /// Column name.
    pub column: &'static str,
    /// Full-text words column used for fuzzy matching.
    pub words_column: Option<&'static str>,
}

macro_rules! core_tag {
    ($keyword:literal, $path:literal, $vr:ident, $level:ident, $column:literal) => {
        CoreTag {
            keyword: $keyword,
            path: $path,
            vr: ValueRepresentation::$vr,
            level: QueryTagLevel::$level,
            column: $column,
            words_column: None,
        }
    };
    ($keyword:literal, $path:literal, $vr:ident, $level:ident, $column:literal, $words:literal) => {
        CoreTag {
            keyword: $keyword,
            path: $path,
            vr: ValueRepresentation::$vr,
            level: QueryTagLevel::$level,
            column: $column,
            words_column: Some($words),
        }
    };
}

/// Every core attribute.
pub static CORE_TAGS: &[CoreTag] = &[
    core_tag!("StudyInstanceUID", "0020000D", UI, Study, "StudyInstanceUid"),
    core_tag!("StudyDate", "00080020", DA, Study, "StudyDate"),
    core_tag!("StudyDescription", "00081030", LO, Study, "StudyDescription"),
    core_tag!("AccessionNumber", "00080050", SH, Study, "AccessionNumber"),
    core_tag!("PatientID", "00100020", LO, Study, "PatientId"),
    core_tag!(
        "PatientName",
        "00100010",
        PN,
        Study,
        "PatientName",
        "PatientNameWords"
    ),
    core_tag!(
        "ReferringPhysicianName",
        "00080090",
        PN,
        Study,
        "ReferringPhysicianName",
        "ReferringPhysicianNameWords"
    ),
    core_tag!("PatientBirthDate", "00100030", DA, Study, "PatientBirthDate"),
    core_tag!("SeriesInstanceUID", "0020000E", UI, Series, "SeriesInstanceUid"),
    core_tag!("Modality", "00080060", CS, Series, "Modality"),
    core_tag!(
        "PerformedProcedureStepStartDate",
        "00400244",
        DA,
        Series,
        "PerformedProcedureStepStartDate"
    ),
    core_tag!(
        "ManufacturerModelName",
        "00081090",
        LO,
        Series,
        "ManufacturerModelName"
    ),
    core_tag!("SOPInstanceUID", "00080018", UI, Instance, "SopInstanceUid"),
];

impl CoreTag {
    /// Looks up a core attribute by keyword.
    pub fn by_keyword(keyword: &str) -> Option<&'static CoreTag> {
        CORE_TAGS.iter().find(|tag| tag.keyword == keyword)
    }

    /// Looks up a core attribute by (normalized) tag path.
    pub fn by_path(path: &str) -> Option<&'static CoreTag> {
        CORE_TAGS
            .iter()
            .find(|tag| tag.path.eq_ignore_ascii_case(path))
    }

    /// StudyInstanceUID.
    pub fn study_instance_uid() -> &'static CoreTag {
        &CORE_TAGS[0]
    }

    /// SeriesInstanceUID.
    pub fn series_instance_uid() -> &'static CoreTag {
        &CORE_TAGS[8]
    }

    /// SOPInstanceUID.
    pub fn sop_instance_uid() -> &'static CoreTag {
        &CORE_TAGS[12]
    }
}
