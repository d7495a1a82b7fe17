use relays_kafka::consumer::{KafkaConsumer, KafkaOffset};

use super::{Offset, TopicClient, TopicMessage};
use crate::Result;

impl TopicClient for KafkaConsumer {
    async fn read(&self) -> Result<Vec<TopicMessage>> {
        let messages = self.read_messages().await?;
        Ok(messages
            .into_iter()
            .map(|message| TopicMessage {
                value: message.value,
                offset: Offset {
                    topic: message.topic,
                    partition: message.partition,
                    offset: message.offset,
                },
            })
            .collect())
    }

    async fn commit(&self, offsets: Vec<Offset>) -> Result<()> {
        let offsets = offsets
            .into_iter()
            .map(|offset| KafkaOffset {
                topic: offset.topic,
                partition: offset.partition,
                offset: offset.offset,
            })
            .collect();
        self.commit_offsets(offsets).await?;
        Ok(())
    }
}
