//! Two-way binding between the schema text and the diagram session
//!
//! Text edits are compiled into the model right away. Model changes are
//! written back to the text only after the user has stopped typing for the
//! quiet window, so regenerated text never overwrites what is being typed.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tokio::sync::Mutex;
//! # use schemax::core::{DiagramSession, MemoryStorage, SchemaEditor, Config};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = DiagramSession::new(Arc::new(MemoryStorage::new()));
//! session.create_diagram("shop", None).await?;
//! let session = Arc::new(Mutex::new(session));
//!
//! let mut editor = SchemaEditor::open(session, &Config::defaults()).await;
//! editor.on_text_change("Table users {\n\tid integer [primary key]\n}").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::Config;
use crate::core::events::DiagramEvent;
use crate::core::reconciliation::ReconciliationPlan;
use crate::core::session::{DiagramSession, SessionResult};

pub struct SchemaEditor {
    session: Arc<Mutex<DiagramSession>>,
    events: broadcast::Receiver<DiagramEvent>,
    text: String,
    last_text_change: Option<Instant>,
    quiet_window: Duration,
    /// Set when a change from elsewhere has not been written to the text yet
    model_changed: bool,
}

impl SchemaEditor {
    /// Bind to a session, starting from its generated text
    pub async fn open(session: Arc<Mutex<DiagramSession>>, config: &Config) -> Self {
        let (text, events) = {
            let session = session.lock().await;
            (session.schema_text(), session.subscribe())
        };
        Self {
            session,
            events,
            text,
            last_text_change: None,
            quiet_window: config.quiet_window,
            model_changed: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether a text edit happened less than the quiet window ago
    pub fn is_typing(&self) -> bool {
        self.last_text_change
            .is_some_and(|at| at.elapsed() < self.quiet_window)
    }

    /// Compile edited text into the model as a single undo step
    pub async fn on_text_change(
        &mut self,
        text: impl Into<String>,
    ) -> SessionResult<ReconciliationPlan> {
        self.text = text.into();
        self.last_text_change = Some(Instant::now());

        let shared = Arc::clone(&self.session);
        let mut session = shared.lock().await;
        // Events queued before this edit came from elsewhere
        if self.drain_events() > 0 {
            self.model_changed = true;
        }
        let result = session.apply_schema_text(&self.text).await;
        // Our own mutations, applied or not, must not trigger a rewrite of the text
        self.drain_events();
        drop(session);

        let plan = result?;
        debug!("Applied text edit: {} mutations", plan.mutation_count());
        Ok(plan)
    }

    /// Regenerate the text after a model change
    ///
    /// Returns the new text, or `None` while the user is typing or when the
    /// text is already up to date.
    pub async fn on_model_change(&mut self) -> Option<&str> {
        if self.is_typing() {
            return None;
        }
        let text = self.session.lock().await.schema_text();
        if text == self.text {
            return None;
        }
        self.text = text;
        Some(&self.text)
    }

    /// Drain pending session events and regenerate once the user is idle
    ///
    /// A change that arrives while typing is remembered and written back by a
    /// later call.
    pub async fn sync(&mut self) -> Option<&str> {
        if self.drain_events() > 0 {
            self.model_changed = true;
        }
        if !self.model_changed || self.is_typing() {
            return None;
        }
        self.model_changed = false;
        self.on_model_change().await
    }

    fn drain_events(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.events.try_recv() {
                Ok(_) => count += 1,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => count += skipped as usize,
                Err(_) => return count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::TablePatch;
    use crate::core::storage::MemoryStorage;

    async fn editor() -> (SchemaEditor, Arc<Mutex<DiagramSession>>) {
        let mut session = DiagramSession::new(Arc::new(MemoryStorage::new()));
        session.create_diagram("test", None).await.unwrap();
        let session = Arc::new(Mutex::new(session));
        let editor = SchemaEditor::open(session.clone(), &Config::defaults()).await;
        (editor, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_change_updates_model() {
        let (mut editor, session) = editor().await;
        let plan = editor
            .on_text_change("Table users {\n\tid integer [primary key]\n}")
            .await
            .unwrap();

        assert_eq!(plan.created_tables.len(), 1);
        assert_eq!(session.lock().await.tables()[0].name, "users");
        assert!(editor.is_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_change_waits_for_quiet_window() {
        let (mut editor, session) = editor().await;
        editor
            .on_text_change("Table users {\n\tid integer [primary key]\n}")
            .await
            .unwrap();

        session
            .lock()
            .await
            .create_table(TablePatch::default())
            .await
            .unwrap();
        assert!(editor.sync().await.is_none());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let text = editor.on_model_change().await.unwrap().to_string();
        assert!(text.contains("Table table_2 {"));
        assert_eq!(editor.text(), text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_made_while_typing_is_synced_later() {
        let (mut editor, session) = editor().await;
        editor
            .on_text_change("Table users {\n\tid integer [primary key]\n}")
            .await
            .unwrap();

        session
            .lock()
            .await
            .create_table(TablePatch::default())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(editor.sync().await.is_none());

        // No new events arrive, the earlier change is still pending
        tokio::time::advance(Duration::from_millis(501)).await;
        let text = editor.sync().await.unwrap();
        assert!(text.contains("Table table_2 {"));
        assert!(editor.sync().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_text_change_does_not_leave_events() {
        let storage = Arc::new(MemoryStorage::new());
        let mut session = DiagramSession::new(storage.clone());
        session.create_diagram("test", None).await.unwrap();
        let session = Arc::new(Mutex::new(session));
        let mut editor = SchemaEditor::open(session, &Config::defaults()).await;

        storage.set_fail_writes(true);
        let result = editor
            .on_text_change("Table users {\n\tid integer [primary key]\n}")
            .await;
        assert!(result.is_err());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(editor.sync().await.is_none());
        assert!(editor.text().contains("Table users {"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_without_events_is_noop() {
        let (mut editor, _) = editor().await;
        assert!(editor.sync().await.is_none());
        assert!(editor.on_model_change().await.is_none());
    }
}
