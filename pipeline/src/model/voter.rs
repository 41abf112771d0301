/// One source row queued for classification. Identity is the owning file
/// plus the stable row index; the free-text fields feed the prompt.
#[derive(Debug, Clone)]
pub struct VoterRecord {
    pub row_index: i64,
    pub details: VoterDetails,
}

#[derive(Debug, Clone, Default)]
pub struct VoterDetails {
    pub name: String,
    pub guardian: String,
    pub house: String,
}
