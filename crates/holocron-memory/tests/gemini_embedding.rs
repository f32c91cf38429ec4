use holocron_memory::{EmbeddingProvider, GeminiEmbeddingProvider};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn batch_embed_returns_vectors_in_order() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-embedding-001:batchEmbedContents"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(serde_json::json!({
            "requests": [{"model": "models/gemini-embedding-001", "outputDimensionality": 3}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [
                {"values": [0.1, 0.2, 0.3]},
                {"values": [0.4, 0.5, 0.6]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiEmbeddingProvider::with_model(
        "test-key".into(),
        "gemini-embedding-001".into(),
        3,
    )
    .with_base_url(server.uri());

    let result = provider
        .embed(&["Character: Rey".to_string(), "Character: Finn".to_string()])
        .await
        .unwrap();
    assert_eq!(result.embeddings.len(), 2);
    assert_eq!(result.embeddings[1], vec![0.4, 0.5, 0.6]);
}

#[tokio::test]
async fn rate_limit_is_marked_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
        .mount(&server)
        .await;

    let provider = GeminiEmbeddingProvider::with_model("k".into(), "gemini-embedding-001".into(), 3)
        .with_base_url(server.uri());
    let err = provider.embed(&["x".to_string()]).await.unwrap_err();
    assert!(holocron_schema::retry::is_retryable(&err));
}

#[tokio::test]
async fn wrong_dimension_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [{"values": [0.1, 0.2]}]
        })))
        .mount(&server)
        .await;

    let provider = GeminiEmbeddingProvider::with_model("k".into(), "gemini-embedding-001".into(), 3)
        .with_base_url(server.uri());
    let err = provider.embed(&["x".to_string()]).await.unwrap_err();
    assert!(err.to_string().contains("dimensions mismatch"));
}
