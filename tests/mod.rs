mod api_tests;
mod circuit_breaker_tests;
mod redis_tests;
mod support;
