use facet::Facet;

/// JSON body of `ok:stream=...`, `ok:query=...` and
/// `ok:stream_change_window <old>=...` replies.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct StreamReply {
    pub id: u32,
}

/// JSON body of a `stream_binary_search` reply.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct SearchReply {
    #[facet(default)]
    pub filtered_msg_index: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortMode {
    ByIndex,
    ByTime,
}

impl SortMode {
    pub fn by_time(self) -> bool {
        matches!(self, Self::ByTime)
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::ByIndex => Self::ByTime,
            Self::ByTime => Self::ByIndex,
        }
    }
}
