//! 插件测试用的写入器和处理器

use super::{Handler, PluginError, RequestContext, ResponseWriter};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use std::sync::{Arc, Mutex};

pub fn sample_query(id: u16) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_ascii("example.com.").unwrap(),
        RecordType::A,
    ));
    message
}

/// 记录所有写入的响应
pub struct RecordingWriter {
    pub responses: Vec<Vec<u8>>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
        }
    }
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    async fn write(&mut self, response: &[u8]) -> std::io::Result<()> {
        self.responses.push(response.to_vec());
        Ok(())
    }

    fn written(&self) -> bool {
        !self.responses.is_empty()
    }
}

/// 记录调用次数和收到的查询，返回固定的响应码
pub struct RecordingHandler {
    rcode: ResponseCode,
    queries: Mutex<Vec<Vec<u8>>>,
}

impl RecordingHandler {
    pub fn new(rcode: ResponseCode) -> Arc<Self> {
        Arc::new(Self {
            rcode,
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<Vec<u8>> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn serve_dns(
        &self,
        _ctx: &RequestContext,
        _writer: &mut dyn ResponseWriter,
        query: &Message,
    ) -> Result<ResponseCode, PluginError> {
        self.queries.lock().unwrap().push(query.to_vec().unwrap());
        Ok(self.rcode)
    }

    fn name(&self) -> &str {
        "recording"
    }
}
