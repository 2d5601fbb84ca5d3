use crate::agent::Agent;
use crate::conversation::ConversationStore;
use crate::db::{ContactInfo, Database};
use crate::errors::AgentResult;
use crate::models::message::Message;

/// Entry point for transports: one reply per human message, per conversation id
pub struct ChatService {
    store: ConversationStore,
    agent: Agent,
    audit: Option<Database>,
}

impl ChatService {
    pub fn new(store: ConversationStore, agent: Agent) -> Self {
        Self {
            store,
            agent,
            audit: None,
        }
    }

    pub fn with_audit(mut self, database: Database) -> Self {
        self.audit = Some(database);
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Run one turn for `conversation_id` and return the final assistant message.
    ///
    /// Turns for the same id run one at a time in arrival order. When an audit
    /// database is configured and a contact is given, the committed turn is
    /// written to it; audit failures never fail the reply.
    pub async fn reply(
        &self,
        conversation_id: &str,
        human: Message,
        contact: Option<&ContactInfo>,
    ) -> AgentResult<Message> {
        let handle = self.store.get_or_create(conversation_id);
        let mut conversation = handle.lock().await;

        let before = conversation.len();
        let reply = match self.agent.run_turn(&mut conversation, human).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, code = e.code(), "turn failed");
                return Err(e);
            }
        };

        if let (Some(database), Some(contact)) = (&self.audit, contact) {
            // The seed goes in with the first committed turn
            let start = if before == 1 { 0 } else { before };
            if let Err(e) = database
                .record_turn(contact, &conversation.messages()[start..])
                .await
            {
                tracing::error!(conversation_id, error = %e, "failed to record turn");
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentSettings;
    use crate::db::MessageType;
    use crate::errors::AgentError;
    use crate::models::role::Role;
    use crate::models::tool::ToolCall;
    use crate::providers::mock::MockProvider;
    use crate::tools::ToolRegistry;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(provider: MockProvider) -> ChatService {
        let agent = Agent::new(
            Box::new(provider),
            ToolRegistry::new(),
            AgentSettings::default(),
        );
        ChatService::new(ConversationStore::new("Eres chabito"), agent)
    }

    #[tokio::test]
    async fn test_turns_alternate() {
        let n = 4;
        let responses = (0..n)
            .map(|i| Message::assistant().with_text(format!("respuesta {}", i)))
            .collect();
        let service = service(MockProvider::new(responses));

        for i in 0..n {
            let reply = service
                .reply("u1", Message::human().with_text(format!("mensaje {}", i)), None)
                .await
                .unwrap();
            assert_eq!(reply.text(), format!("respuesta {}", i));
        }

        let history = service.store().snapshot("u1").await.unwrap();
        assert_eq!(history.len(), 1 + 2 * n);
        assert_eq!(history[0].role, Role::System);
        for (i, pair) in history[1..].chunks(2).enumerate() {
            assert_eq!(pair[0].role, Role::Human);
            assert_eq!(pair[0].text(), format!("mensaje {}", i));
            assert_eq!(pair[1].role, Role::Assistant);
        }
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let provider = MockProvider::new(vec![
            Message::assistant().with_text("para a"),
            Message::assistant().with_text("para b"),
        ]);
        let service = service(provider.clone());

        service
            .reply("a", Message::human().with_text("soy a"), None)
            .await
            .unwrap();
        service
            .reply("b", Message::human().with_text("soy b"), None)
            .await
            .unwrap();

        // The second call never sees the first conversation
        let histories = provider.histories();
        assert_eq!(histories[1].len(), 2);
        assert_eq!(histories[1][1].text(), "soy b");
    }

    #[tokio::test]
    async fn test_same_id_turns_are_serialized() {
        let provider = MockProvider::new(vec![
            Message::assistant().with_text("uno"),
            Message::assistant().with_text("dos"),
        ])
        .with_delay(Duration::from_millis(20));
        let service = Arc::new(service(provider.clone()));

        let first = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .reply("u1", Message::human().with_text("primero"), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .reply("u1", Message::human().with_text("segundo"), None)
                    .await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // The second turn saw the completed first turn
        let histories = provider.histories();
        assert_eq!(histories[1].len(), 4);
        let history = service.store().snapshot("u1").await.unwrap();
        assert_eq!(history.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_recorded() {
        let database = Database::connect("sqlite::memory:").await.unwrap();
        database.migrate().await.unwrap();
        let provider = MockProvider::new(vec![Message::assistant()
            .with_tool_request("1", Ok(ToolCall::new("missing", json!({}))))]);
        let service = service(provider).with_audit(database.clone());
        let contact = ContactInfo::new("5215512345678", "Ana");

        let err = service
            .reply("u1", Message::human().with_text("hola"), Some(&contact))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::UnknownTool("missing".to_string()));
        assert!(database
            .find_contact_by_phone_number("5215512345678")
            .await
            .unwrap()
            .is_none());
        assert_eq!(service.store().snapshot("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_turns_are_audited() {
        let database = Database::connect("sqlite::memory:").await.unwrap();
        database.migrate().await.unwrap();
        let provider = MockProvider::new(vec![
            Message::assistant().with_text("Hola Ana"),
            Message::assistant().with_text("Adiós Ana"),
        ]);
        let service = service(provider).with_audit(database.clone());
        let contact = ContactInfo::new("5215512345678", "Ana");

        service
            .reply("u1", Message::human().with_text("Hola"), Some(&contact))
            .await
            .unwrap();
        service
            .reply("u1", Message::human().with_text("Adiós"), Some(&contact))
            .await
            .unwrap();

        let stored = database
            .find_contact_by_phone_number("5215512345678")
            .await
            .unwrap()
            .unwrap();
        let conversation = database
            .find_active_conversation(&stored.id)
            .await
            .unwrap()
            .unwrap();
        let messages = database
            .find_messages_by_conversation(&conversation.id)
            .await
            .unwrap();
        let types: Vec<MessageType> = messages
            .iter()
            .map(|m| m.message_type().unwrap())
            .collect();
        assert_eq!(
            types,
            vec![
                MessageType::System,
                MessageType::Human,
                MessageType::Ai,
                MessageType::Human,
                MessageType::Ai
            ]
        );
    }
}
