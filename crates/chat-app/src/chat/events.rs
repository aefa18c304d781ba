/// Destinations the conversation and subscription flows can send the user to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Landing,
    Login,
    Chat,
    Subscription,
}

/// Side effects emitted by the conversation view controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// Navigate away from the conversation view. Emitted at most once per view.
    Redirect { route: Route },
    /// The in-memory message list changed and now holds `len` entries.
    TranscriptChanged { len: usize },
}
